// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use ssconn::{util, Config, Layer};

use util::validators::{
  parse_socketaddr, validate_byte_count, validate_existing_file, validate_layer, validate_method,
  validate_socketaddr,
};

mod client;
mod listen;
mod server;

fn decoration_args(command: Command<'static>) -> Command<'static> {
  command
    .arg(
      Arg::new("config")
        .help("JSON file describing the cipher and decorator layers")
        .long("config")
        .short('c')
        .validator(validate_existing_file)
        .takes_value(true),
    )
    .arg(
      Arg::new("method")
        .long("method")
        .short('m')
        .validator(validate_method)
        .takes_value(true),
    )
    .arg(
      Arg::new("password")
        .long("password")
        .short('k')
        .takes_value(true),
    )
    .arg(
      Arg::new("partial")
        .help("Encrypt only the first N bytes of each direction")
        .long("partial")
        .validator(validate_byte_count)
        .takes_value(true),
    )
    .arg(
      Arg::new("layer")
        .help("Decorator applied over the cipher; repeat in application order")
        .long("layer")
        .short('l')
        .validator(validate_layer)
        .takes_value(true)
        .multiple_occurrences(true),
    )
    .arg(
      Arg::new("defer-close")
        .help("Hold finished connections open for a randomized interval")
        .long("defer-close"),
    )
}

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
    .subcommand(decoration_args(
      Command::new("client")
        .alias("-c")
        .about("Accept plaintext locally and relay it to a server over the decorated stack")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:1080")
            .takes_value(true),
        )
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        ),
    ))
    .subcommand(decoration_args(
      Command::new("server")
        .alias("-s")
        .about("Accept decorated connections and relay them to a fixed upstream")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("0.0.0.0:8388")
            .takes_value(true),
        )
        .arg(
          Arg::new("upstream")
            .long("upstream")
            .short('u')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        ),
    ))
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
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Builds the effective configuration: the config file if given, overridden by explicit flags
pub fn config_arg_handling(args: &'_ ArgMatches) -> Result<Config> {
  let mut config = match args.value_of("config") {
    Some(path) => Config::from_file(path).with_context(|| format!("Loading config from {}", path))?,
    None => Config::new(
      args
        .value_of("method")
        .context("--method is required without --config")?,
      args
        .value_of("password")
        .context("--password is required without --config")?,
    ),
  };
  if let Some(method) = args.value_of("method") {
    config.method = method.into();
  }
  if let Some(password) = args.value_of("password") {
    config.password = password.into();
  }
  if let Some(partial) = args.value_of("partial") {
    config.partial_encryption = Some(partial.parse().context("Parsing --partial")?);
  }
  if let Some(layers) = args.values_of("layer") {
    config.layers = layers
      .map(str::parse::<Layer>)
      .collect::<Result<Vec<_>, _>>()?;
  }
  if args.is_present("defer-close") {
    config.defer_close = true;
  }
  config.validate()?;
  Ok(config)
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    listen: parse_socketaddr(args.value_of("listen").context("Listen address is required")?)?,
    server: parse_socketaddr(args.value_of("server").context("Server address is required")?)?,
    config: config_arg_handling(args)?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    listen: parse_socketaddr(args.value_of("listen").context("Listen address is required")?)?,
    upstream: parse_socketaddr(
      args
        .value_of("upstream")
        .context("Upstream address is required")?,
    )?,
    config: config_arg_handling(args)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let args = server_arg_handling(opts)?;
      tracing::info!(listen = %args.listen, upstream = %args.upstream, layers = ?args.config.layers, "Running as server");
      server::server_main(args).await
    }
    Some(("client", opts)) => {
      let args = client_arg_handling(opts)?;
      tracing::info!(listen = %args.listen, server = %args.server, layers = ?args.config.layers, "Running as client");
      client::client_main(args).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
