use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use haul_app::DirectResolver;
use haul_core::{ResolveError, UrlResolver};
use httpmock::Method::{GET, HEAD};
use httpmock::MockServer;

fn resolver() -> Result<DirectResolver> {
    Ok(DirectResolver::new(Duration::from_secs(5))?)
}

fn no_headers() -> BTreeMap<String, String> {
    BTreeMap::new()
}

#[tokio::test]
async fn content_disposition_names_the_file() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(HEAD).path("/download");
        then.status(200)
            .header("content-disposition", "attachment; filename=\"quarterly.pdf\"");
    });

    let resolved = resolver()?
        .resolve(&server.url("/download"), &no_headers())
        .await?;
    mock.assert();
    assert_eq!(resolved.filename, "quarterly.pdf");
    assert_eq!(resolved.url, server.url("/download"));
    Ok(())
}

#[tokio::test]
async fn redirects_are_followed_to_the_final_url() -> Result<()> {
    let server = MockServer::start_async().await;
    let target = server.url("/files/archive.tar.gz");
    let hop = server.mock(|when, then| {
        when.method(HEAD).path("/latest");
        then.status(302).header("location", target.as_str());
    });
    let landing = server.mock(|when, then| {
        when.method(HEAD).path("/files/archive.tar.gz");
        then.status(200);
    });

    let resolved = resolver()?
        .resolve(&server.url("/latest"), &no_headers())
        .await?;
    hop.assert();
    landing.assert();
    assert_eq!(resolved.url, target);
    assert_eq!(resolved.filename, "archive.tar.gz");
    Ok(())
}

#[tokio::test]
async fn refused_head_falls_back_to_get() -> Result<()> {
    let server = MockServer::start_async().await;
    let head = server.mock(|when, then| {
        when.method(HEAD).path("/blob");
        then.status(405);
    });
    let get = server.mock(|when, then| {
        when.method(GET).path("/blob");
        then.status(200).body("hello world");
    });

    let resolved = resolver()?
        .resolve(&server.url("/blob"), &no_headers())
        .await?;
    head.assert();
    get.assert();
    assert_eq!(resolved.filename, "blob");
    assert_eq!(resolved.size, Some(11));
    Ok(())
}

#[tokio::test]
async fn caller_headers_are_sent_and_kept() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(HEAD)
            .path("/private/report.csv")
            .header("authorization", "Bearer secret");
        then.status(200);
    });
    let headers = BTreeMap::from([("authorization".to_string(), "Bearer secret".to_string())]);

    let resolved = resolver()?
        .resolve(&server.url("/private/report.csv"), &headers)
        .await?;
    mock.assert();
    assert_eq!(resolved.headers, headers);
    assert_eq!(resolved.filename, "report.csv");
    Ok(())
}

#[tokio::test]
async fn error_statuses_are_reported() -> Result<()> {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(HEAD).path("/gone");
        then.status(404);
    });

    let result = resolver()?
        .resolve(&server.url("/gone"), &no_headers())
        .await;
    assert!(matches!(result, Err(ResolveError::Status { status: 404, .. })));
    Ok(())
}

#[tokio::test]
async fn torrents_and_ftp_pass_through_untouched() -> Result<()> {
    let resolver = resolver()?;
    let magnet = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=ubuntu";
    let resolved = resolver.resolve(magnet, &no_headers()).await?;
    assert_eq!(resolved.url, magnet);
    assert_eq!(resolved.filename, "ubuntu");
    assert_eq!(resolved.size, None);

    let ftp = resolver
        .resolve("ftp://mirror.example.com/pub/image.iso", &no_headers())
        .await?;
    assert_eq!(ftp.filename, "image.iso");
    Ok(())
}

#[tokio::test]
async fn unknown_schemes_are_unsupported() -> Result<()> {
    let result = resolver()?
        .resolve("gopher://example.com/file", &no_headers())
        .await;
    assert!(matches!(result, Err(ResolveError::Unsupported { .. })));
    Ok(())
}
