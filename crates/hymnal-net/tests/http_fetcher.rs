use hymnal_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, ResponseSource, Url};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetches_body_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/static/hymns.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"[{"number":1,"title":"Holy, Holy, Holy"}]"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
    let url = Url::parse(&format!("{}/static/hymns.json", server.uri())).unwrap();
    let response = fetcher.fetch(&Request::get(url)).await.unwrap();

    assert!(response.ok());
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert!(response.text().unwrap().contains("Holy, Holy, Holy"));
}

#[tokio::test]
async fn non_success_status_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(path("/api/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
    let url = Url::parse(&format!("{}/api/missing", server.uri())).unwrap();
    let response = fetcher.fetch(&Request::get(url)).await.unwrap();

    assert_eq!(response.status.as_u16(), 404);
    assert!(!response.ok());
}

#[tokio::test]
async fn refused_connection_is_unreachable() {
    // Nothing listens on port 1 of the loopback interface.
    let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
    let url = Url::parse("http://127.0.0.1:1/index.html").unwrap();
    let err = fetcher.fetch(&Request::get(url)).await.unwrap_err();

    assert!(matches!(err, NetError::Unreachable(_)), "got {err:?}");
}
