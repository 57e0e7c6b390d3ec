//! Frame codec micro-benchmarks.
//!
//! Run with: cargo bench -p smqtt --bench codec

use std::time::Instant;

use bytes::BytesMut;
use smqtt::QoS;
use smqtt::protocol::packet::create_connect;
use smqtt::protocol::{MAX_PACKET_SIZE, Packet, Publish, Subscribe, codec};

const ITERATIONS: u32 = 100_000;

fn bench<F: FnMut()>(name: &str, mut f: F) {
    for _ in 0..1000 {
        f();
    }

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    let per_op = start.elapsed() / ITERATIONS;
    let ops_per_sec = match per_op.as_nanos() {
        0 => 0,
        nanos => 1_000_000_000 / nanos,
    };

    println!("{:40} {:>10.2?} per op, {:>12} ops/sec", name, per_op, format_number(ops_per_sec as u64));
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn encoded(packet: &Packet) -> Vec<u8> {
    packet.encode().map(|b| b.to_vec()).unwrap_or_default()
}

fn bench_remaining_length() {
    println!("\n=== Remaining Length ===");

    let mut buf = BytesMut::with_capacity(4);
    for (label, value) in [("127 (1 byte)", 127), ("16383 (2 bytes)", 16_383), ("268435455 (4 bytes)", 268_435_455)] {
        bench(&format!("encode {label}"), || {
            buf.clear();
            let _ = codec::write_variable_int(&mut buf, value);
        });
    }

    for (label, bytes) in [
        ("127 (1 byte)", &[0x7F][..]),
        ("16383 (2 bytes)", &[0xFF, 0x7F][..]),
        ("268435455 (4 bytes)", &[0xFF, 0xFF, 0xFF, 0x7F][..]),
    ] {
        bench(&format!("decode {label}"), || {
            let _ = codec::read_variable_int(bytes);
        });
    }
}

fn bench_publish() {
    println!("\n=== PUBLISH ===");

    let mut buf = BytesMut::with_capacity(16 * 1024);
    for size in [100usize, 1024, 10 * 1024] {
        let Ok(publish) = Publish::new("sensors/temp", vec![0u8; size], 1) else {
            return;
        };
        let packet = Packet::Publish(publish);
        let frame = encoded(&packet);

        bench(&format!("encode {size}B payload"), || {
            buf.clear();
            let _ = packet.write(&mut buf);
        });
        bench(&format!("decode {size}B payload"), || {
            let _ = Packet::read(&frame, MAX_PACKET_SIZE);
        });
    }
}

fn bench_control_packets() {
    println!("\n=== CONNECT / SUBSCRIBE ===");

    let mut buf = BytesMut::with_capacity(256);
    let Ok(connect) = create_connect("benchmark-client-1234", Some("username"), Some("password"), 60, true) else {
        return;
    };
    let frame = encoded(&connect);
    bench("encode CONNECT", || {
        buf.clear();
        let _ = connect.write(&mut buf);
    });
    bench("decode CONNECT", || {
        let _ = Packet::decode(&frame);
    });

    let Ok(subscribe) = Subscribe::new(1, "device/gear-001/state") else {
        return;
    };
    let subscribe = Packet::Subscribe(subscribe.with_qos(QoS::AtLeastOnce));
    let frame = encoded(&subscribe);
    bench("encode SUBSCRIBE", || {
        buf.clear();
        let _ = subscribe.write(&mut buf);
    });
    bench("decode SUBSCRIBE", || {
        let _ = Packet::decode(&frame);
    });
}

fn main() {
    println!("smqtt Codec Benchmark");
    println!("=====================");
    println!("Iterations per benchmark: {}", ITERATIONS);

    bench_remaining_length();
    bench_publish();
    bench_control_packets();

    println!("\nBenchmark complete!");
}
