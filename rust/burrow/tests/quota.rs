//! Per-user quota: fairness between senders and full rollback on failure.

use burrow::{
    Bus, BusConfig, Endpoint, HandleId, Limits, OpError, Received, Resource, SendArgs,
};

fn small_bus(messages: u32) -> Bus {
    Bus::new(BusConfig {
        peer_limits: Limits {
            messages,
            ..Limits::default()
        },
        user_limits: Limits::default(),
    })
}

fn send_one(endpoint: &Endpoint, destination: HandleId) -> Result<(), OpError> {
    endpoint
        .send(&SendArgs {
            destinations: &[destination],
            payload: b"q",
            ..SendArgs::default()
        })
        .map(|_| ())
}

/// Two endpoints under different uids, both holding a handle to the same
/// receiver node. Returns (receiver, u1 endpoint, u1's id, u2 endpoint,
/// u2's id).
fn two_senders(bus: &Bus) -> (burrow::ClonedPeer, Endpoint, HandleId, Endpoint, HandleId) {
    let u1 = bus.endpoint(1);
    u1.init(1 << 16).unwrap();
    let receiver = u1.clone_peer(0, 1 << 16).unwrap();

    // Hand a second, differently-owned endpoint a handle to the receiver's
    // node: capabilities travel by message.
    let u2_peer = u1.clone_peer(2, 1 << 16).unwrap();
    u1.send(&SendArgs {
        destinations: &[u2_peer.handle],
        handles: &[receiver.handle],
        ..SendArgs::default()
    })
    .unwrap();
    let Received::Message(delivery) = u2_peer.endpoint.recv().unwrap() else {
        panic!("expected the capability message");
    };
    u2_peer
        .endpoint
        .release_slice(delivery.payload_offset)
        .unwrap();
    let r_on_u2 = delivery.handles[0];

    let r_on_u1 = receiver.handle;
    (receiver, u1, r_on_u1, u2_peer.endpoint, r_on_u2)
}

#[test]
fn single_sender_is_capped_at_half_the_budget() {
    let bus = small_bus(8);
    let (_receiver, u1, r_on_u1, _u2, _) = two_senders(&bus);

    for _ in 0..4 {
        send_one(&u1, r_on_u1).unwrap();
    }
    assert_eq!(
        send_one(&u1, r_on_u1).unwrap_err(),
        OpError::Quota(Resource::Messages)
    );
}

#[test]
fn second_user_shrinks_the_first_users_cap() {
    let bus = small_bus(8);
    let (_receiver, u1, r_on_u1, u2, r_on_u2) = two_senders(&bus);

    for _ in 0..4 {
        send_one(&u1, r_on_u1).unwrap();
    }

    // The other user still gets in...
    send_one(&u2, r_on_u2).unwrap();

    // ...and u1 stays over its shrunken cap even though only 5 of 8 are
    // used.
    assert_eq!(
        send_one(&u1, r_on_u1).unwrap_err(),
        OpError::Quota(Resource::Messages)
    );
}

#[test]
fn delivery_returns_the_budget() {
    let bus = small_bus(8);
    let (receiver, u1, r_on_u1, _u2, _) = two_senders(&bus);

    for _ in 0..4 {
        send_one(&u1, r_on_u1).unwrap();
    }
    assert!(send_one(&u1, r_on_u1).is_err());

    for _ in 0..4 {
        let Received::Message(delivery) = receiver.endpoint.recv().unwrap() else {
            panic!("expected a message");
        };
        receiver
            .endpoint
            .release_slice(delivery.payload_offset)
            .unwrap();
    }

    // Everything settled: the full cap is available again.
    for _ in 0..4 {
        send_one(&u1, r_on_u1).unwrap();
    }
}

#[test]
fn failed_multi_destination_send_rolls_back_completely() {
    let bus = small_bus(8);
    let (_receiver, u1, r_on_u1, _u2, _) = two_senders(&bus);

    for _ in 0..3 {
        send_one(&u1, r_on_u1).unwrap();
    }

    // Two charges on the same peer: the first fits (4th message), the
    // second does not (would be the 5th); the whole send must unwind.
    let err = u1
        .send(&SendArgs {
            destinations: &[r_on_u1, r_on_u1],
            payload: b"q",
            ..SendArgs::default()
        })
        .unwrap_err();
    assert_eq!(err, OpError::Quota(Resource::Messages));

    // The rollback left room for exactly one more.
    send_one(&u1, r_on_u1).unwrap();
    assert!(send_one(&u1, r_on_u1).is_err());
}

#[test]
fn payload_memory_is_bounded_by_the_pool() {
    let bus = Bus::new(BusConfig::default());
    let a = bus.endpoint(1);
    a.init(4096).unwrap();
    let b = a.clone_peer(1, 4096).unwrap();

    let big = vec![0u8; 3000];
    let err = a
        .send(&SendArgs {
            destinations: &[b.handle],
            payload: &big,
            ..SendArgs::default()
        })
        .unwrap_err();
    assert_eq!(err, OpError::Quota(Resource::Memory));

    // Half the pool is fine.
    let ok = vec![0u8; 1000];
    a.send(&SendArgs {
        destinations: &[b.handle],
        payload: &ok,
        ..SendArgs::default()
    })
    .unwrap();
}

#[test]
fn fd_budget_is_enforced_globally() {
    let bus = Bus::new(BusConfig {
        peer_limits: Limits::default(),
        user_limits: Limits {
            fds: 2,
            ..Limits::default()
        },
    });
    let a = bus.endpoint(1);
    a.init(1 << 16).unwrap();
    let b = a.clone_peer(1, 1 << 16).unwrap();

    // A global budget of 2 admits no charge at all under the half-rule.
    let err = a
        .send(&SendArgs {
            destinations: &[b.handle],
            n_fds: 1,
            ..SendArgs::default()
        })
        .unwrap_err();
    assert_eq!(err, OpError::Quota(Resource::Fds));

    // Without fds the same send is fine.
    a.send(&SendArgs {
        destinations: &[b.handle],
        ..SendArgs::default()
    })
    .unwrap();
}
