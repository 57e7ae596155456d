// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Level, LevelFilter, Logger};

use relay_rpc::memory::MemoryHub;
use relay_rpc::{
    AccessPolicy, CallConfig, HandlerError, HandlerResult, Params, Registration, RpcConfig,
};

static APP: &'static str = "relayserve";
static SERVER_ORIGIN: &'static str = "https://server.example";
static DEFAULT_CALLER_ORIGIN: &'static str = "https://caller.example";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Run two relay-rpc peers on a lossy in-memory channel and make one call")
        .version(crate_version!())
        .arg(
            Arg::with_name("method")
                .help("Name of the procedure to call (echo, date, add, greet)")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded array or object of parameters")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("loss")
                .help("Probability that the channel drops a message (Default: 0)")
                .long("loss")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retries")
                .help("Number of resends before giving up (Default: 5)")
                .long("retries")
                .short("r")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for each attempt (Default: 1000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("origin")
                .help("Origin the calling peer claims")
                .long("origin")
                .short("o")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("allow")
                .help("Origin pattern the server accepts calls from (Default: *)")
                .long("allow")
                .short("a")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn date_handler(_args: Vec<Value>) -> HandlerResult {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HandlerError::new(&e.to_string()))?;
    Ok(json!({ "timestamp": now.as_millis() as u64 }))
}

fn add_handler(args: Vec<Value>) -> HandlerResult {
    args.iter().try_fold(0.0, |sum, arg| match arg.as_f64() {
        Some(n) => Ok(sum + n),
        None => Err(HandlerError::with_data("Expected numbers", arg.clone())),
    })
    .map(Value::from)
}

fn greet_handler(args: Vec<Value>) -> HandlerResult {
    let greeting = args.get(0).and_then(Value::as_str).unwrap_or("hello");
    match args.get(1).and_then(Value::as_str) {
        Some(name) => Ok(json!(format!("{}, {}", greeting, name))),
        None => Err(HandlerError::new("Missing name")),
    }
}

fn params_of(args: Value) -> Result<Params, String> {
    match args {
        Value::Array(list) => Ok(Params::Positional(list)),
        Value::Object(map) => Ok(Params::Named(map)),
        other => Err(format!("Expected a JSON array or object, got {}", other)),
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let level = if matches.is_present("verbose") {
        Level::Trace
    } else {
        Level::Info
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let method = String::from(matches.value_of("method").unwrap_or_else(|| {
        eprintln!("Failed to parse method argument as String");
        process::exit(1)
    }));
    let args = value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit());
    let params = params_of(args).unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1)
    });
    let loss = value_t!(matches, "loss", f64).unwrap_or(0.0);
    let origin = matches.value_of("origin").unwrap_or(DEFAULT_CALLER_ORIGIN);
    let allow = matches.value_of("allow").unwrap_or("*");

    let mut config = RpcConfig::default();
    if let Ok(retries) = value_t!(matches, "retries", i32) {
        config.retries = retries;
    }
    if let Ok(timeout) = value_t!(matches, "timeout", u64) {
        config.timeout_ms = timeout;
    }

    let policy = AccessPolicy::new(vec![allow], Vec::<String>::new()).unwrap_or_else(|e| {
        eprintln!("Invalid origin pattern: {}", e);
        process::exit(1)
    });

    let hub = MemoryHub::new(Some(&root_log));
    let (server, server_client, server_task) =
        hub.spawn_engine(SERVER_ORIGIN, RpcConfig::default());
    let (_caller, caller_client, caller_task) = hub.spawn_engine(origin, config);
    hub.set_loss(loss);

    let procedures = vec![
        ("echo", Registration::new(|args| Ok(Value::Array(args)))),
        ("date", Registration::new(date_handler)),
        ("add", Registration::new(add_handler)),
        (
            "greet",
            Registration::new(greet_handler).params(vec!["greeting", "name"]),
        ),
    ];
    for (name, registration) in procedures {
        debug!(root_log, "registering procedure"; "method" => name);
        let registration = registration.policy(policy.clone());
        if let Err(e) = server_client.register(name, registration) {
            error!(root_log, "failed to register procedure"; "method" => name, "err" => %e);
            process::exit(1)
        }
    }

    info!(root_log, "calling procedure"; "method" => &method, "loss" => loss);
    let started = tokio::time::Instant::now();
    let outcome = match caller_client.call(CallConfig::new(server, &method).params(params)) {
        Ok(pending) => pending.await,
        Err(e) => {
            eprintln!("Invalid call options: {}", e);
            process::exit(1)
        }
    };
    let elapsed: Duration = started.elapsed();

    match outcome {
        Ok(result) => {
            info!(root_log, "call succeeded"; "elapsed_ms" => elapsed.as_millis() as u64);
            println!("{}", result);
        }
        Err(e) => {
            error!(root_log, "call failed"; "kind" => ?e.kind(),
                "elapsed_ms" => elapsed.as_millis() as u64);
            eprintln!("Error: {}", e);
        }
    }

    for (peer, client, task) in vec![
        ("caller", caller_client, caller_task),
        ("server", server_client, server_task),
    ] {
        if let Err(e) = client.shutdown() {
            error!(root_log, "failed to stop engine"; "peer" => peer, "err" => %e);
        }
        if let Err(e) = task.await {
            error!(root_log, "engine task failed"; "peer" => peer, "err" => %e);
        }
    }
}
