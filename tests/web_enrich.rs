use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use twistedpair::types::Signal;
use twistedpair::web::fetch::TRUNCATION_MARKER;
use twistedpair::web::{
    BraveSearch, DuckDuckGoSearch, FetchError, PageFetcher, WebEnricher, WebSearchClient,
    WEB_SEARCH_TAG,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ARTICLE: &str = r#"
<html>
  <head><title>Stellarator milestone</title><script>var x = 1;</script></head>
  <body>
    <nav>Home | About</nav>
    <header>Site banner</header>
    <main>
      <h1>Stellarator milestone</h1>
      <p>The device held plasma for eight minutes.</p>
    </main>
    <footer>Copyright</footer>
  </body>
</html>
"#;

fn fetcher() -> PageFetcher {
    PageFetcher::with_config(Duration::from_secs(5), vec!["twistedpair-test/1.0".into()]).unwrap()
}

fn enricher(server: &MockServer) -> WebEnricher {
    let brave = BraveSearch::with_config(
        format!("{}/brave", server.uri()),
        Some("k".into()),
        Duration::from_secs(5),
    )
    .unwrap();
    let ddg = DuckDuckGoSearch::with_config(format!("{}/html/", server.uri()), Duration::from_secs(5))
        .unwrap();
    WebEnricher::new(WebSearchClient::new(Arc::new(brave), Arc::new(ddg)), fetcher())
}

#[tokio::test]
async fn fetch_extracts_main_content_and_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(ARTICLE, "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    let url = format!("{}/article", server.uri());
    let page = fetcher().fetch(&url, 10_000).await.unwrap();

    assert_eq!(page.url, url);
    assert_eq!(page.title, "Stellarator milestone");
    assert!(page.text.contains("eight minutes"));
    assert!(!page.text.contains("Home | About"));
    assert!(!page.text.contains("Copyright"));
    assert!(!page.text.contains("var x"));
    assert_eq!(page.metadata.content_type, "text/html; charset=utf-8");
    assert!(page.metadata.domain.starts_with("127.0.0.1:"));
    assert_eq!(page.metadata.length, page.text.chars().count());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get("user-agent").unwrap(),
        "twistedpair-test/1.0"
    );
}

#[tokio::test]
async fn fetch_truncates_to_budget_with_marker() {
    let server = MockServer::start().await;
    let body = format!("<html><body><article><p>{}</p></article></body></html>", "x".repeat(500));
    Mock::given(method("GET"))
        .and(path("/long"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(&server)
        .await;

    let page = fetcher()
        .fetch(&format!("{}/long", server.uri()), 100)
        .await
        .unwrap();
    assert!(page.text.ends_with(TRUNCATION_MARKER));
    assert!(page.text.starts_with(&"x".repeat(100)));
}

#[tokio::test]
async fn batch_fetch_keeps_order_and_isolates_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ARTICLE, "text/html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let urls = vec![
        format!("{}/gone", server.uri()),
        "not a url".to_string(),
        format!("{}/ok", server.uri()),
    ];
    let results = fetcher().fetch_many(&urls, 1_000).await;

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], Err(FetchError::Status { status: 404, .. })));
    assert!(matches!(results[1], Err(FetchError::InvalidUrl(_))));
    assert_eq!(results[2].as_ref().unwrap().title, "Stellarator milestone");
}

#[tokio::test]
async fn enrich_is_identity_without_intent() {
    let server = MockServer::start().await;
    let signal = Signal::new("Explain quantum entanglement in simple terms.", "manual://input")
        .with_tags(["physics"]);

    let out = enricher(&server).enrich(&signal).await;

    assert_eq!(out, signal);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn enrich_splices_fetched_pages_in_rank_order() {
    let server = MockServer::start().await;
    let ok_url = format!("{}/ok", server.uri());
    let gone_url = format!("{}/gone", server.uri());

    Mock::given(method("GET"))
        .and(path("/brave"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "web": { "results": [
                { "title": "Fusion page", "description": "Plasma snippet", "url": ok_url },
                { "title": "Dead page", "description": "Gone snippet", "url": gone_url }
            ]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(ARTICLE, "text/html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let signal = Signal::new("Search web for fusion energy breakthroughs", "manual://input")
        .with_tags(["energy"]);
    let out = enricher(&server).enrich(&signal).await;

    assert_eq!(out.id, signal.id);
    assert_eq!(out.captured_at, signal.captured_at);
    assert_eq!(out.source, "web://fusion energy breakthroughs");
    assert_eq!(out.tags, vec!["energy".to_string(), WEB_SEARCH_TAG.to_string()]);

    assert!(out.content.starts_with("Search web for fusion energy breakthroughs\n\n"));
    assert!(out
        .content
        .contains("WEB SEARCH RESULTS FOR: fusion energy breakthroughs"));
    let first = out.content.find("[SOURCE 1] Fusion page").unwrap();
    let second = out.content.find("[SOURCE 2] Dead page").unwrap();
    assert!(first < second);
    assert!(out.content[first..second].contains("eight minutes"));
    assert!(out.content[second..].contains("Gone snippet"));
    assert!(out.content[second..].contains("[Full content unavailable"));

    assert_eq!(out.metadata["web_enriched"], true);
    assert_eq!(out.metadata["web_search_query"], "fusion energy breakthroughs");
    let sources = out.metadata["web_sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0]["status"], "fetched");
    assert_eq!(sources[1]["status"], "snippet_only");
    assert_eq!(sources[1]["snippet"], "Gone snippet");
}

#[tokio::test]
async fn enrich_returns_original_when_search_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let signal = Signal::new("rust async runtimes, check online", "manual://input");
    let out = enricher(&server).enrich(&signal).await;
    assert_eq!(out, signal);
}

#[tokio::test]
async fn enrich_returns_original_when_search_finds_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/brave"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "web": { "results": [] } })))
        .mount(&server)
        .await;

    let signal = Signal::new("look online for obscure trivia", "manual://input");
    let out = enricher(&server).enrich(&signal).await;
    assert_eq!(out, signal);
}
