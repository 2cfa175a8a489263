use clap::Parser;
use fixtures::{network, run_server, FixtureAccount, FixtureArgs, FixtureOptions, NonceMode};

/// Fake AT Protocol network: handle resolver, PLC directory, PDS and
/// authorization server on one port
#[derive(Parser, Debug)]
#[clap(name = "pds-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    /// Accounts to serve, as `handle=did` pairs
    #[arg(long = "account", value_parser = parse_account)]
    accounts: Vec<FixtureAccount>,

    /// Require DPoP nonces on every endpoint
    #[arg(long)]
    require_nonce: bool,

    /// Lifetime of issued access tokens, in seconds
    #[arg(long, default_value = "3600")]
    access_token_expires_in: i64,
}

fn parse_account(raw: &str) -> Result<FixtureAccount, String> {
    let (handle, did) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected handle=did, got {raw}"))?;
    if !did.starts_with("did:") {
        return Err(format!("{did} is not a DID"));
    }
    Ok(FixtureAccount::new(handle, did))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let mut options = FixtureOptions {
        access_token_expires_in: args.access_token_expires_in,
        ..FixtureOptions::default()
    };
    if !args.accounts.is_empty() {
        options.accounts = args.accounts;
    }
    if args.require_nonce {
        options.par_nonce = NonceMode::Required;
        options.token_nonce = NonceMode::Required;
        options.resource_nonce = NonceMode::Required;
    }

    run_server(args.common, move |addr| network::router(addr, options)).await
}
