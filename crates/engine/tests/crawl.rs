// ABOUTME: End-to-end tests of the engine against mock book sites served by httpmock.
// ABOUTME: Covers fan-out search with dedup and timeout, the detail/chapter/content chain, and export/import.

use std::time::Duration;

use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use shelf_engine::{DnsMode, Engine, SearchOptions, TaskStatus};

async fn engine() -> Engine {
    Engine::builder()
        .dns(DnsMode::System)
        .allow_loopback(true)
        .build()
        .await
        .unwrap()
}

fn search_page(books: &[(&str, &str, &str)]) -> String {
    let items: String = books
        .iter()
        .map(|(href, name, author)| {
            format!(r#"<li class="book"><a href="{href}">{name}</a><span class="author">作者：{author}</span></li>"#)
        })
        .collect();
    format!("<html><body><ul>{items}</ul></body></html>")
}

fn source_json(name: &str, server: &MockServer) -> String {
    json!({
        "bookSourceName": name,
        "bookSourceUrl": server.base_url(),
        "ruleSearchUrl": "/search?q={{key}}",
        "ruleSearchList": "li.book",
        "ruleSearchName": "a@text",
        "ruleSearchAuthor": "span.author@text",
        "ruleSearchNoteUrl": "a@href"
    })
    .to_string()
}

#[tokio::test]
async fn search_keeps_exact_matches_and_dedups_across_sources() {
    let first = MockServer::start_async().await;
    first.mock(|when, then| {
        when.method(GET).path("/search").query_param("q", "Dune");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(search_page(&[
                ("/b/1", "Dune", "Frank Herbert"),
                ("/b/2", "Dune Messiah", "Frank Herbert"),
            ]));
    });
    let second = MockServer::start_async().await;
    second.mock(|when, then| {
        when.method(GET).path("/search");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(search_page(&[("/x/9", "DUNE", "frank herbert")]));
    });
    let broken = MockServer::start_async().await;
    broken.mock(|when, then| {
        when.method(GET).path("/search");
        then.status(404);
    });

    let engine = engine().await;
    engine.add_or_update_raw(&source_json("First", &first)).await.unwrap();
    engine.add_or_update_raw(&source_json("Second", &second)).await.unwrap();
    engine.add_or_update_raw(&source_json("Broken", &broken)).await.unwrap();

    let results = engine
        .search("Dune", &SearchOptions::new().sources(["First", "Second", "Broken"]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_name, "First");
    assert_eq!(results[0].author, "Frank Herbert");
    assert_eq!(results[0].book_url, format!("{}/b/1", first.base_url()));

    let stats = engine.get_by_name("First").await.unwrap().stats;
    assert_eq!(stats.count, 1);
    assert!(stats.last_used.is_some());
    assert_eq!(engine.get_by_name("Broken").await.unwrap().stats.count, 0);
}

#[tokio::test]
async fn aggregate_timeout_fails_the_whole_search() {
    let quick = MockServer::start_async().await;
    quick.mock(|when, then| {
        when.method(GET).path("/search");
        then.status(200)
            .delay(Duration::from_millis(100))
            .body(search_page(&[("/b/1", "Dune", "Herbert")]));
    });
    let hanging = MockServer::start_async().await;
    hanging.mock(|when, then| {
        when.method(GET).path("/search");
        then.status(200)
            .delay(Duration::from_secs(5))
            .body(search_page(&[("/b/2", "Dune", "Other")]));
    });

    let engine = engine().await;
    engine.add_or_update_raw(&source_json("Quick", &quick)).await.unwrap();
    engine.add_or_update_raw(&source_json("Hanging", &hanging)).await.unwrap();

    let err = engine
        .search(
            "Dune",
            &SearchOptions::new().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(err.is_aggregate_timeout());
}

#[tokio::test]
async fn detail_chapters_and_content_chain() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(GET).path("/book/7");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(
                r#"<html><body>
                <h1>Dune</h1>
                <p class="author">作者：Frank Herbert</p>
                <p class="intro">Spice and sand.</p>
                <a href="/book/7/index.html">查看目录</a>
                </body></html>"#,
            );
    });
    server.mock(|when, then| {
        when.method(GET).path("/book/7/index.html");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(
                r#"<html><body><ul class="toc">
                <li><a href="1.html">Chapter 1</a></li>
                <li><a href="2.html">Chapter 2</a></li>
                </ul></body></html>"#,
            );
    });
    server.mock(|when, then| {
        when.method(GET).path("/book/7/1.html");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(
                r#"<html><body><div id="content">
                <p>A beginning is a very delicate time.</p>
                <p>ADVERT visit our site</p>
                <p>Know then that it is the year 10191.</p>
                </div></body></html>"#,
            );
    });

    let engine = engine().await;
    let def = json!({
        "name": "Arrakis",
        "url": server.base_url(),
        "detail": {"name": "h1@text", "author": "p.author@text", "intro": "p.intro@text"},
        "chapters": {"list": "ul.toc li"},
        "content": {"selector": "#content@html", "filters": ["re:ADVERT.*"]}
    });
    engine.add_or_update_raw(&def.to_string()).await.unwrap();

    let book_url = server.url("/book/7");
    let detail = engine.get_detail(&book_url, "Arrakis").await.unwrap();
    assert_eq!(detail.name, "Dune");
    assert_eq!(detail.author, "Frank Herbert");
    assert_eq!(detail.intro.as_deref(), Some("Spice and sand."));

    let chapters = engine.get_chapters(&book_url, "Arrakis").await.unwrap();
    let names: Vec<&str> = chapters.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Chapter 1", "Chapter 2"]);
    assert_eq!(chapters[1].index, 1);
    assert_eq!(chapters[0].url, server.url("/book/7/1.html"));

    let content = engine
        .get_chapter_content(&chapters[0].url, "Arrakis")
        .await
        .unwrap();
    assert!(content.text.contains("A beginning is a very delicate time."));
    assert!(content.text.contains("year 10191."));
    assert!(!content.text.contains("ADVERT"));
    assert_eq!(content.applied_filters, vec!["re:ADVERT.*"]);

    let missing = engine
        .get_chapter_content(&server.url("/book/7/404.html"), "Arrakis")
        .await
        .unwrap_err();
    assert_eq!(missing.http_status(), Some(404));
}

#[tokio::test]
async fn export_then_import_reproduces_definitions() {
    let source = engine().await;
    let payload = json!([
        {"bookSourceName": "A", "bookSourceUrl": "https://a.example", "bookSourceGroup": "g1",
         "ruleSearchUrl": "/s?k={{key}}", "ruleSearchList": "li", "ruleSearchName": "a",
         "ruleSearchNoteUrl": "a@href", "usageCount": 12},
        {"name": "B", "url": "https://b.example", "enabled": false,
         "content": {"selector": "#c", "filters": ["ad"]}}
    ])
    .to_string();
    let id = source.import_batch(payload);
    let task = source.wait_for_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.success, 2);

    let exported = source.export_sources().await.unwrap();
    let target = engine().await;
    let id = target.import_batch(exported.clone());
    assert_eq!(target.wait_for_task(&id).await.unwrap().success, 2);

    let expected: Vec<_> = source
        .list_sources()
        .await
        .into_iter()
        .map(|d| d.without_stats())
        .collect();
    assert_eq!(target.list_sources().await, expected);
    assert_eq!(target.export_sources().await.unwrap(), exported);
}
