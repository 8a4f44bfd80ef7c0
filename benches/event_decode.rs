use chrono::{TimeZone, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use realtime_sync::api::WireChatMessage;
use realtime_sync::channel::{ClientFrame, Event};
use realtime_sync::chat::{ChatMessage, DeliveryOrigin, MessageStore};

const NOTIFICATION: &str = r#"{"event":"new_notification","data":{"_id":"65f0c1","title":"Booking accepted","message":"Your cleaner is on the way","notification_type":"booking","created_at":"2024-05-01T08:00:00Z","is_read":false}}"#;
const CHAT: &str = r#"{"event":"receive_message","data":{"_id":"m-991","booking_id":"b-17","sender_id":"u-2","receiver_id":"u-1","message_text":"I am at the gate","message_type":"text","created_at":"2024-05-01T08:01:30Z"}}"#;
const LOCATION: &str = r#"{"event":"location_update","data":{"booking_id":"b-17","latitude":6.4541,"longitude":3.3947,"speed":7.5,"heading":182.0}}"#;
const UNKNOWN: &str = r#"{"event":"promo_banner","data":{"campaign":"spring"}}"#;

fn bench_event_decode(c: &mut Criterion) {
    let frames: Vec<&[u8]> = [NOTIFICATION, CHAT, LOCATION, UNKNOWN]
        .iter()
        .map(|s| s.as_bytes())
        .collect();

    c.bench_function("decode_1000_mixed_events", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let event = Event::decode(black_box(frames[i % frames.len()]));
                black_box(event.ok());
            }
        })
    });

    c.bench_function("decode_1000_location_updates", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(Event::decode(black_box(LOCATION.as_bytes())).ok());
            }
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = ClientFrame::LocationUpdate {
        booking_id: "b-17".into(),
        latitude: 6.4541,
        longitude: 3.3947,
        speed: Some(7.5),
        heading: None,
    };

    c.bench_function("encode_1000_location_frames", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(black_box(&frame).encode().ok());
            }
        })
    });
}

fn bench_store_merge(c: &mut Criterion) {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    // Poll pages arrive oldest first; the channel interleaves a few out of order.
    let history: Vec<ChatMessage> = (0..500i64)
        .map(|i| {
            let wire = WireChatMessage {
                id: format!("m{i:04}"),
                booking_id: Some("b-17".into()),
                sender_id: if i % 2 == 0 { "u-1".into() } else { "u-2".into() },
                receiver_id: None,
                message_text: format!("message {i}"),
                message_type: None,
                image_url: None,
                created_at: Some(base + chrono::Duration::seconds((i * 7) % 500)),
                is_read: true,
            };
            ChatMessage::from_wire(wire, "b-17", DeliveryOrigin::Poll, base)
        })
        .collect();

    c.bench_function("merge_500_messages_twice", |b| {
        b.iter(|| {
            let mut store = MessageStore::new();
            for message in history.iter().chain(history.iter()) {
                store.insert(black_box(message.clone()));
            }
            black_box(store.len());
        })
    });
}

criterion_group!(
    benches,
    bench_event_decode,
    bench_frame_encode,
    bench_store_merge
);
criterion_main!(benches);
