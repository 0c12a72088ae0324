use std::time::Duration;

use clap::Parser;
use tokenward::{
    cache::MemoryCache, sources::client_credential::ClientCredentialFetcher, AppId, AppSecret,
    CacheKey, TokenManager,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The application ID issued by the platform
    #[clap(short, long, env)]
    app_id: AppId,

    /// The application secret used to identify the client to the authority
    #[clap(short = 's', long, env, hide_env_values = true)]
    app_secret: AppSecret,

    /// The authority's token request URL
    #[clap(
        short,
        long,
        env,
        default_value = tokenward::sources::client_credential::DEFAULT_TOKEN_URL
    )]
    token_url: reqwest::Url,

    /// Seconds to subtract from a token's lifetime before it is refreshed
    #[clap(long, env, default_value_t = tokenward::DEFAULT_EXPIRE_BUFFER_SECS)]
    expire_buffer: u64,

    /// Number of concurrent callers to simulate on each tick
    #[clap(long, default_value_t = 8)]
    callers: usize,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;

    let cache_key = CacheKey::namespaced("miniprogram:access_token:", &opts.app_id);

    let fetcher = ClientCredentialFetcher::new(client, opts.app_id, opts.app_secret)
        .with_token_url(opts.token_url);

    let cache = MemoryCache::new();
    let _cleanup = cache.spawn_cleanup(Duration::from_secs(60));

    let manager = TokenManager::builder()
        .cache(cache)
        .cache_key(cache_key)
        .fetcher(fetcher)
        .expire_buffer_secs(opts.expire_buffer)
        .build()?;

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let callers: Vec<_> = (0..opts.callers)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        for caller in callers {
            match caller.await? {
                Ok(token) => tracing::debug!(
                    token = format_args!("{:#?}", token),
                    "pulled access token"
                ),
                Err(error) => tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to obtain access token"
                ),
            }
        }
    }
}
