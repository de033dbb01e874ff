//! Delivery order through the router and presence order across nodes.

use proptest::prelude::*;
use serde_json::{json, Value};
use tasksync_realtime::connection::create_connection;
use tasksync_realtime::{
    EventName, OutboundEvent, PresenceAnnouncement, PresenceConfig, PresenceTracker, RoomRouter,
};
use tasksync_types::{DeviceClass, PresenceStatus, Transport, UserId};

const USERS: [&str; 3] = ["alice", "bob", "carol"];

fn status(i: u8) -> PresenceStatus {
    match i % 4 {
        0 => PresenceStatus::Online,
        1 => PresenceStatus::Away,
        2 => PresenceStatus::Busy,
        _ => PresenceStatus::Offline,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn router_preserves_emission_order_per_connection(
        devices in prop::collection::vec(1usize..4, USERS.len()),
        targets in prop::collection::vec(0usize..USERS.len(), 1..40),
    ) {
        let router = RoomRouter::new();
        let mut receivers = Vec::new();
        for (user, count) in USERS.iter().zip(&devices) {
            for _ in 0..*count {
                let (conn, rx) =
                    create_connection(UserId::new(*user), Transport::InProcess, DeviceClass::Web);
                router.join(conn);
                receivers.push((*user, rx));
            }
        }

        for (n, target) in targets.iter().enumerate() {
            let event = OutboundEvent::new(EventName::TodoUpdated, json!({ "n": n }));
            router.deliver(&UserId::new(USERS[*target]), &event);
        }

        for (user, rx) in receivers.iter_mut() {
            let expected: Vec<u64> = targets
                .iter()
                .enumerate()
                .filter(|(_, t)| USERS[**t] == *user)
                .map(|(n, _)| n as u64)
                .collect();
            let mut seen = Vec::new();
            while let Ok(text) = rx.try_recv() {
                let frame: Value = serde_json::from_str(&text).unwrap();
                seen.push(frame["data"]["n"].as_u64().unwrap());
            }
            prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn remote_presence_settles_on_newest_announcement(
        (announced, arrival) in prop::collection::vec(0u8..4, 1..12).prop_flat_map(|s| {
            let order: Vec<usize> = (0..s.len()).collect();
            (Just(s), Just(order).prop_shuffle())
        }),
    ) {
        let (tracker, _expired) = PresenceTracker::new(PresenceConfig::default());
        let alice = UserId::new("alice");
        let sent: Vec<PresenceAnnouncement> = announced
            .iter()
            .enumerate()
            .map(|(seq, s)| PresenceAnnouncement {
                user_id: alice.clone(),
                status: status(*s),
                device: DeviceClass::Web,
                last_activity: 0,
                seq: seq as u64 + 1,
            })
            .collect();

        for i in arrival {
            tracker.apply_remote("node-b", &sent[i]);
        }

        let newest = &sent[sent.len() - 1];
        prop_assert_eq!(tracker.status(&alice), newest.status);
    }
}
