use criterion::{criterion_group, criterion_main, Criterion};
use svpn_transport::stun::StunMessage;

fn encode_decode_roundtrip(c: &mut Criterion) {
    let mut msg = StunMessage::binding_request();
    msg.add_xor_mapped_address("203.0.113.7:4500".parse().unwrap());
    let encoded = msg.encode();

    c.bench_function("stun_decode_binding_response", |b| {
        b.iter(|| StunMessage::decode(&encoded).unwrap());
    });

    c.bench_function("stun_encode_binding_request", |b| {
        b.iter(StunMessage::binding_request);
    });
}

criterion_group!(benches, encode_decode_roundtrip);
criterion_main!(benches);
