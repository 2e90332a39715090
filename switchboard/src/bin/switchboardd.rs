use clap::{App, Arg};
use color_eyre::eyre::Report;
use std::net::IpAddr;
use switchboard::Config;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args()?;
    switchboard::run::start(config)
}

fn parse_args() -> Result<Config, Report> {
    let matches = App::new("switchboardd")
        .version("0.1")
        .about("HTTP/JSON-RPC dispatch broker: matches clients to long-polling workers.")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("ADDR")
                .help("address to bind")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("port to listen on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("threads")
                .long("threads")
                .value_name("N")
                .help("number of event-loop threads (defaults to the core count)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("jsonrpc2")
                .long("jsonrpc2")
                .help("wrap error responses in the JSON-RPC 2.0 envelope"),
        )
        .arg(
            Arg::with_name("no-nodelay")
                .long("no-nodelay")
                .help("leave Nagle's algorithm enabled on accepted sockets"),
        )
        .get_matches();

    let host: IpAddr = matches.value_of("host").unwrap_or("127.0.0.1").parse()?;
    let port: u16 = matches.value_of("port").unwrap_or("8001").parse()?;
    let threads: usize = match matches.value_of("threads") {
        Some(threads) => threads.parse()?,
        None => num_cpus::get(),
    };

    let mut config = Config::new(host, port);
    config.set_threads(threads);
    config.set_jsonrpc2(matches.is_present("jsonrpc2"));
    config.set_tcp_nodelay(!matches.is_present("no-nodelay"));
    Ok(config)
}
