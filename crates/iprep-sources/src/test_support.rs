use axum::Router;
use iprep_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::net::TcpListener;

/// Serves `router` on an ephemeral loopback port and returns its base URL.
pub(crate) async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}

/// Fetcher that gives up after the first failed attempt.
pub(crate) fn quiet_fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    })
    .expect("fetcher")
}
