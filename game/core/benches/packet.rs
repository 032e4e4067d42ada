#[macro_use]
extern crate criterion;

use courier::net::support::PayloadBatch;
use criterion::Criterion;
use gamecore::event::{Event, EventKind};
use gamecore::packet::Packet;
use gamecore::transfer::digest;

fn event_batch(c: &mut Criterion) {
    c.bench_function("encode_events_200", |b| {
        b.iter(|| {
            let mut batch = PayloadBatch::new();
            for i in 0..200u32 {
                batch.push(Event::new((i % 4) as u8, 100 + i, EventKind::Sell { whom: i }));
            }

            let mut packets = 0;
            while !batch.is_empty() {
                Packet::encode_events(&mut batch).unwrap();
                packets += 1;
            }
            packets
        })
    });
}

fn packet_decode(c: &mut Criterion) {
    let mut batch = PayloadBatch::new();
    for i in 0..40u32 {
        batch.push(Event::new(1, i, EventKind::Deploy { whom: i }));
    }
    let datagram = Packet::encode_events(&mut batch).unwrap();

    c.bench_function("decode_events_40", move |b| b.iter(|| Packet::decode(&datagram).unwrap()));
}

fn scenario_digest(c: &mut Criterion) {
    let scenario = vec![0x5au8; 64 * 1024];

    c.bench_function("digest_64k", move |b| b.iter(|| digest(&scenario)));
}

criterion_group!(benches, event_batch, packet_decode, scenario_digest);
criterion_main!(benches);
