//! Synthetic end-to-end session: a simulated population with direction-tuned
//! neurons that come into view over time, driven through the in-memory store.

use std::path::PathBuf;

use ndarray::{s, Array2};

use neurofit::boundary::{ActivityFrame, FrameNotice, MemoryStore, TickOutcome};
use neurofit::controller::{FitConfig, OnlineFitController};
use neurofit::observer::ControllerAdapter;
use neurofit::prng::Prng;
use neurofit::snapshot;
use neurofit::stimulus::StimulusEvent;

const POPULATION: usize = 30;
const FIRST_VISIBLE: usize = 12;
const DIRECTIONS: [i64; 8] = [3, 10, 9, 16, 4, 14, 13, 12];
const PERIOD: usize = 40;

struct Options {
    frames: usize,
    seed: u64,
    out: Option<PathBuf>,
}

fn print_help() {
    println!("neurofit (online point-process GLM fit on a synthetic session)");
    println!("usage:");
    println!("  cargo run -- [--frames N] [--seed S] [--out DIR]");
    println!("  cargo run -- --help");
}

fn parse_options() -> Options {
    let mut opts = Options {
        frames: 1000,
        seed: 7,
        out: None,
    };
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--help" | "-h" | "help", _) => {
                print_help();
                std::process::exit(0);
            }
            ("--frames", Some(v)) => opts.frames = v.parse().unwrap_or(opts.frames),
            ("--seed", Some(v)) => opts.seed = v.parse().unwrap_or(opts.seed),
            ("--out", Some(v)) => opts.out = Some(PathBuf::from(v)),
            (other, _) => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(2);
            }
        }
        i += 2;
    }
    opts
}

/// Stimulus schedule: off at frame 0, then each period one direction is shown
/// for 15 frames.
fn stimulus_at(frame: usize) -> Option<StimulusEvent> {
    let id = DIRECTIONS[(frame / PERIOD) % DIRECTIONS.len()];
    match frame % PERIOD {
        _ if frame == 0 => Some(StimulusEvent::new(0, id, 0.0)),
        10 => Some(StimulusEvent::new(frame, id, 5.0)),
        25 => Some(StimulusEvent::new(frame, id, 0.0)),
        _ => None,
    }
}

fn preferred(neuron: usize) -> i64 {
    DIRECTIONS[neuron % DIRECTIONS.len()]
}

fn main() {
    tracing_subscriber::fmt::init();
    let opts = parse_options();
    let cfg = FitConfig::default()
        .with_neurons(FIRST_VISIBLE, FIRST_VISIBLE)
        .with_horizon(opts.frames + 1)
        .with_learning_rate(1e-3);
    let mut controller = match OnlineFitController::new(cfg) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let mut rng = Prng::new(opts.seed);
    let mut store = MemoryStore::default();
    let mut spikes = Array2::<f64>::zeros((POPULATION, opts.frames + 1));
    let mut showing: Option<(i64, usize)> = None;

    for frame in 0..=opts.frames {
        if let Some(ev) = stimulus_at(frame) {
            showing = (ev.intensity > 0.0).then_some((ev.raw_id, frame));
            controller.apply_stimulus(ev);
        }

        for n in 0..POPULATION {
            let driven = matches!(showing, Some((id, at)) if id == preferred(n) && frame >= at + 3);
            let rate = if driven { 1.2 } else { 0.08 };
            spikes[[n, frame]] = rng.poisson(rate) as f64;
        }

        let notice = if frame > 0 && frame % 97 == 0 {
            FrameNotice::Missing { frame }
        } else {
            let visible = (FIRST_VISIBLE + frame / 50).min(POPULATION);
            let handle = format!("est{frame}");
            let activity = spikes.slice(s![..visible, ..=frame]).to_owned();
            store.put_frame(handle.clone(), ActivityFrame::new(activity));
            FrameNotice::Ready { handle, frame }
        };

        match controller.tick(notice, &mut store) {
            TickOutcome::Published {
                milestone: true, ..
            } => {
                if let Some(root) = &opts.out {
                    if let Err(e) = snapshot::write_milestone(root, &controller.milestone_snapshot()) {
                        eprintln!("milestone snapshot failed: {e}");
                    }
                }
            }
            TickOutcome::Dropped { frame, reason } => eprintln!("frame {frame} dropped: {reason}"),
            _ => {}
        }

        if frame % 100 == 0 {
            let s = ControllerAdapter::new(&controller).status();
            println!(
                "frame={:5} state={:?} neurons={:2} steps={:4} ll={:.6} onsets={}",
                s.frame,
                s.state,
                s.modeled_neurons,
                s.fitted_steps,
                s.last_likelihood.unwrap_or(f64::NAN),
                s.total_onsets,
            );
        }
    }

    controller.shutdown();

    let avg = &controller.tuning_summary().global_average;
    println!("global tuning over directions: {avg:.3}");
    if let Some(secs) = controller.mean_frame_time() {
        println!("average time per frame: {:.3} ms", secs * 1e3);
    }

    if let Some(root) = &opts.out {
        match snapshot::write_final(root, &controller.final_snapshot()) {
            Ok(files) => println!("wrote {} files under {}", files.len(), root.display()),
            Err(e) => {
                eprintln!("final snapshot failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
