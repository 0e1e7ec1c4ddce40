//! CLI client for the `neurofitd` daemon.
//!
//! Examples:
//!   neurofit-cli status
//!   neurofit-cli stim 120 3 5.0
//!   neurofit-cli push est120 activity.txt
//!   neurofit-cli ready est120 120
//!   neurofit-cli missing 121
//!   neurofit-cli analysis 120
//!   neurofit-cli save
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process;
use std::time::Duration;

use neurofit::boundary::protocol::{Request, Response};
use neurofit::boundary::{ActivityFrame, AnalysisBundle};
use neurofit::observer::FitStatus;
use neurofit::snapshot::read_table;
use serde_json::json;

fn usage() -> ! {
    eprintln!("neurofit-cli (talks to neurofitd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: neurofit-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                          Show fit state");
    eprintln!("  stim <frame> <id> <intensity>   Send a stimulus event");
    eprintln!("  push <handle> <table.txt>       Store an activity table under a handle");
    eprintln!("  ready <handle> <frame>          Announce a stored frame");
    eprintln!("  missing <frame>                 Announce a missing frame");
    eprintln!("  analysis <frame>                Show the published analysis for a frame");
    eprintln!("  save                            Save the fitted model image");
    eprintln!("  shutdown                        Write final snapshot and exit daemon");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_state(s: FitStatus) {
    let ll = s
        .last_likelihood
        .map(|v| format!("{v:.6}"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "state={:?} frame={} neurons={}/{} (modeled/observed) params={} steps={} ll={}",
        s.state,
        s.frame,
        s.modeled_neurons,
        s.observed_neurons,
        s.parameter_count,
        s.fitted_steps,
        ll,
    );
    println!("stimuli: ids={:?} onsets={}", s.stimulus_ids, s.total_onsets);
}

fn print_analysis(b: &AnalysisBundle) {
    let (neurons, frames) = b.activity.dim();
    println!(
        "frame={} milestone={} activity={}x{} ll_points={}",
        b.frame,
        b.milestone,
        neurons,
        frames,
        b.likelihood.len()
    );
    let avg: Vec<String> = b
        .tuning
        .global_average
        .iter()
        .map(|v| format!("{v:.3}"))
        .collect();
    println!("global tuning: [{}]", avg.join(", "));
    for (id, onsets) in &b.onsets {
        println!("stimulus {id}: {} onsets", onsets.len());
    }
}

fn nth_arg(args: &[String], i: usize) -> &str {
    match args.get(i) {
        Some(a) => a.as_str(),
        None => usage(),
    }
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let arg = |i: usize| nth_arg(&args, i);

    let req = match cmd.as_str() {
        "status" => Request::GetState,
        "stim" => {
            let frame = arg(1);
            let id: i64 = arg(2)
                .parse()
                .unwrap_or_else(|_| make_error("id must be an integer"));
            let intensity: f64 = arg(3)
                .parse()
                .unwrap_or_else(|_| make_error("intensity must be a number"));
            if frame.parse::<usize>().is_err() {
                make_error("frame must be a non-negative integer");
            }
            let mut event = serde_json::Map::new();
            event.insert(frame.to_string(), json!([id, intensity]));
            Request::Stimulus {
                event: event.into(),
            }
        }
        "push" => {
            let handle = arg(1).to_string();
            let activity = read_table(Path::new(arg(2)))
                .unwrap_or_else(|e| make_error(&format!("read {}: {e}", arg(2))));
            Request::PutFrame {
                handle,
                payload: ActivityFrame::new(activity),
            }
        }
        "ready" => {
            let handle = arg(1).to_string();
            let frame: usize = arg(2)
                .parse()
                .unwrap_or_else(|_| make_error("frame must be a non-negative integer"));
            Request::FrameReady { handle, frame }
        }
        "missing" => {
            let frame: usize = arg(1)
                .parse()
                .unwrap_or_else(|_| make_error("frame must be a non-negative integer"));
            Request::FrameMissing { frame }
        }
        "analysis" => {
            let frame: usize = arg(1)
                .parse()
                .unwrap_or_else(|_| make_error("frame must be a non-negative integer"));
            Request::GetAnalysis { frame }
        }
        "save" => Request::SaveModel,
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::State(s)) => print_state(s),
        Ok(Response::Analysis(b)) => print_analysis(&b),
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
