#![no_main]

use libfuzzer_sys::fuzz_target;
use lobby_sync::{Participant, Room, RoomChanges};

fuzz_target!(|data: &[u8]| {
    let Ok(changes) = serde_json::from_slice::<RoomChanges>(data) else {
        return;
    };

    let mut room = Room {
        max_players: 4,
        available_slots: 2,
        host_id: "host".into(),
        participants: vec![Participant::new("host", "Host"), Participant::new("guest", "Guest")],
        ..Room::default()
    };
    changes.apply_to(&mut room);

    // Slots never exceed capacity after a diff without an explicit count.
    if changes.available_slots.is_none() {
        assert!(room.available_slots <= room.max_players);
    }
    let _ = room.dump_data();
    let _ = room.dump_participant_data();
});
