#[macro_use]
extern crate criterion;

use courier::net::address::Address;
use courier::net::header::{Code, Header};
use courier::net::manager::{ConnectionManager, ManagerSettings};
use courier::net::transport::LoopbackHub;
use criterion::Criterion;
use flux::logging;

fn header_roundtrip(c: &mut Criterion) {
    let payload = [7u8; 128];

    c.bench_function("header_roundtrip", move |b| {
        b.iter(|| {
            let datagram = Header::new(Code::DataAck, 1234).datagram(&payload).unwrap();
            Header::read(&mut &datagram[..]).unwrap()
        })
    });
}

fn loopback_exchange(c: &mut Criterion) {
    c.bench_function("loopback_exchange_32", |b| {
        b.iter(|| {
            let hub = LoopbackHub::new();
            let log = logging::discard();

            let mut first = ConnectionManager::new(hub.transport(1), ManagerSettings::default(), &log);
            let mut second = ConnectionManager::new(hub.transport(2), ManagerSettings::default(), &log);
            first.open().unwrap();
            second.open().unwrap();

            let outbound = first.create_connection(2, "second", Address::Node(2)).unwrap();
            let inbound = second.create_connection(1, "first", Address::Node(1)).unwrap();

            for i in 0..32u8 {
                first.send_private(outbound, &[i; 64], true).unwrap();
            }

            first.service(0).unwrap();
            second.service(0).unwrap();
            first.service(1).unwrap();

            let mut received = 0;
            while second.get_private(inbound).is_some() {
                received += 1;
            }
            received
        })
    });
}

criterion_group!(benches, header_roundtrip, loopback_exchange);
criterion_main!(benches);
