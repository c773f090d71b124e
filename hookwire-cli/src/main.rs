// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use hookwire::util;
use std::path::Path;

use util::validators::{
  parse_millis, parse_socketaddr, validate_existing_file, validate_millis, validate_socketaddr,
};

mod mock;
mod proxy;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("proxy")
        .about("Relay framed JSON messages, pairing every client with its own backend connection")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:9000")
            .takes_value(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("dial-timeout")
            .help("Milliseconds to wait for each backend connection")
            .long("dial-timeout")
            .validator(validate_millis)
            .default_value("5000")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("mock")
        .about("Answer framed JSON messages from a file of canned replies")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:9000")
            .takes_value(true),
        )
        .arg(
          Arg::new("stubs")
            .long("stubs")
            .short('s')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn proxy_arg_handling(args: &'_ ArgMatches) -> Result<proxy::ProxyArgs> {
  Ok(proxy::ProxyArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap())?,
    target: parse_socketaddr(args.value_of("target").unwrap())?,
    dial_timeout: parse_millis(args.value_of("dial-timeout").unwrap())?,
  })
}

pub fn mock_arg_handling(args: &'_ ArgMatches) -> Result<mock::MockArgs> {
  Ok(mock::MockArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap())?,
    stubs: Path::new(args.value_of("stubs").unwrap()).to_path_buf(),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("proxy", opts) => {
      let config = proxy_arg_handling(opts)?;
      tracing::info!("Running as proxy with config {:#?}", config);
      proxy::proxy_main(config).await
    }
    ("mock", opts) => {
      let config = mock_arg_handling(opts)?;
      tracing::info!("Running as mock server with config {:#?}", config);
      mock::mock_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
