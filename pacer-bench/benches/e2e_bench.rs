//! End-to-end benchmarks against the simulated controller.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pacer_client::{Client, Connection, ConnectionConfig};
use pacer_core::Slot;
use pacer_sim::{Config, Simulator};
use tokio::runtime::Runtime;

struct TestSetup {
    simulator: Simulator,
    client: Client,
}

fn setup_simulator_and_client(rt: &Runtime) -> TestSetup {
    let mut config = Config::default();
    config.firmware.step_rate_hz = 1_000_000;

    rt.block_on(async {
        let simulator = Simulator::start(config);
        let (host, controller) = tokio::io::duplex(4096);
        tokio::spawn(simulator.serve_stream(controller, "bench"));

        let client = Client::new(Connection::from_stream(host, ConnectionConfig::new()));
        client.handshake().await.unwrap();
        TestSetup { simulator, client }
    })
}

fn bench_request_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_simulator_and_client(&rt);

    c.bench_function("e2e_firmware_name", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.firmware_name().await.unwrap()) });
    });

    setup.simulator.shutdown();
}

fn bench_queue_status(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_simulator_and_client(&rt);

    c.bench_function("e2e_queue_status", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.queue_status().await.unwrap()) });
    });

    setup.simulator.shutdown();
}

fn bench_queue_delays(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_simulator_and_client(&rt);
    let slots = vec![Slot::Delay { micros: 1 }; 50];

    let mut group = c.benchmark_group("e2e_queue_slots");
    group.throughput(Throughput::Elements(slots.len() as u64));
    group.bench_function("delay_50", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(setup.client.queue_slots(&slots).await.unwrap()) });
    });
    group.finish();

    setup.simulator.shutdown();
}

criterion_group!(
    benches,
    bench_request_latency,
    bench_queue_status,
    bench_queue_delays,
);

criterion_main!(benches);
