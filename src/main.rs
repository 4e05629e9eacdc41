use clap::Parser;
use color_eyre::eyre;
use simdram::request;
use simdram::{Config, MemoryController, UpstreamChannel};
use std::sync::{Arc, Mutex};

/// Drive the DRAM model with a deterministic synthetic request stream and
/// report the per-channel statistics.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Number of controller cycles to simulate
    #[arg(long, default_value_t = 100_000)]
    cycles: u64,
    /// Number of requests in the synthetic stream
    #[arg(long, default_value_t = 10_000)]
    requests: usize,
    /// Share of writes in the stream, in percent
    #[arg(long, default_value_t = 25)]
    write_percent: u64,
    /// Requests injected upstream per cycle
    #[arg(long, default_value_t = 2)]
    inject_per_cycle: usize,
}

/// Splitmix-style generator: deterministic across runs and platforms.
fn next_random(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let options = Options::parse();

    let config = Config::default();
    let upstream = Arc::new(Mutex::new(UpstreamChannel::new()));
    let mut controller = MemoryController::new(&config, vec![Arc::clone(&upstream)])?;
    controller.initialize();
    controller.begin_phase();

    let line_mask = !(config.line_size as u64 - 1);
    let address_mask = controller.size_bytes() - 1;

    let mut rng = 0x5EED_u64;
    let mut injected = 0;
    let mut completed = 0usize;
    for _ in 0..options.cycles {
        {
            let mut upstream = upstream.lock().unwrap();
            for _ in 0..options.inject_per_cycle {
                if injected >= options.requests {
                    break;
                }
                let sample = next_random(&mut rng);
                let address = sample & address_mask & line_mask;
                let packet = request::Builder {
                    address,
                    v_address: address,
                    data: sample,
                    response_requested: true,
                    ..request::Builder::default()
                };
                if sample % 100 < options.write_percent {
                    upstream.wq.enqueue(packet.build());
                } else {
                    upstream.rq.enqueue(packet.build());
                }
                injected += 1;
            }
        }

        controller.operate();

        let upstream = upstream.lock().unwrap();
        let mut returned = upstream.returned.lock().unwrap();
        while returned.dequeue().is_some() {
            completed += 1;
        }
    }
    controller.end_phase(0);

    log::info!(
        "injected {injected} requests, received {completed} responses in {} cycles",
        options.cycles
    );
    let report: Vec<_> = controller
        .channels()
        .iter()
        .map(|channel| channel.roi_stats.clone())
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
