#![allow(dead_code)]

use std::{
    io::{Cursor, Write},
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    http::{
        HeaderMap, Method, Response, StatusCode,
        header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, ETAG},
    },
    routing::get,
    serve,
};
use futures::{StreamExt, future::ready, stream};
use meca_config::Config;
use reqwest_middleware::ClientWithMiddleware;
use tokio::net::TcpListener;
use url::Url;
use zip::{ZipWriter, write::SimpleFileOptions};

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest xmlns="https://manuscriptexchange.org/schema/manifest" version="2.0">
  <item id="a-pdf" item-type="article-pdf">
    <instance media-type="application/pdf" href="article.pdf"/>
  </item>
  <item id="a-src" item-type="article-source-directory">
    <instance media-type="application/x-directory" href="bundle/"/>
  </item>
</manifest>"#;

/// Writes a zip archive with the given entries into memory.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A bundle laid out the way journals export them.
pub fn meca_bundle() -> Vec<u8> {
    zip_bytes(&[
        ("manifest.xml", MANIFEST),
        ("article.pdf", "%PDF-1.4"),
        ("bundle/myst.yml", "version: 1"),
        ("bundle/notebooks/analysis.ipynb", "{}"),
    ])
}

/// What a route of the [`TestHttpServer`] answers with.
#[derive(Clone)]
pub struct Route {
    pub body: Vec<u8>,
    pub status: StatusCode,
    pub etag: Option<&'static str>,
    pub delay: Option<Duration>,
    /// Send the body and then never finish the response.
    pub stall: bool,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            body,
            status: StatusCode::OK,
            etag: None,
            delay: None,
            stall: false,
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub fn with_etag(mut self, etag: &'static str) -> Self {
        self.etag = Some(etag);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

async fn respond(route: Route, method: Method, headers: HeaderMap) -> Response<Body> {
    if let Some(delay) = route.delay {
        tokio::time::sleep(delay).await;
    }

    let accept = headers.get(ACCEPT).and_then(|value| value.to_str().ok());
    if method == Method::GET && accept != Some("application/zip") {
        return Response::builder()
            .status(StatusCode::NOT_ACCEPTABLE)
            .body(Body::empty())
            .unwrap();
    }

    let mut builder = Response::builder()
        .status(route.status)
        .header(CONTENT_TYPE, "application/zip");
    if let Some(etag) = route.etag {
        builder = builder.header(ETAG, etag);
    }

    let body = if route.stall {
        let first = stream::once(ready(Ok::<_, std::io::Error>(Bytes::from(route.body))));
        Body::from_stream(first.chain(stream::pending()))
    } else {
        builder = builder.header(CONTENT_LENGTH, route.body.len());
        Body::from(route.body)
    };
    builder.body(body).unwrap()
}

pub struct TestHttpServer {
    base: Url,
}

impl TestHttpServer {
    pub async fn spawn(routes: Vec<(&'static str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = Url::parse(&format!("http://{addr}/")).unwrap();

        let mut router = Router::new();
        for (path, route) in routes {
            let handler =
                move |method: Method, headers: HeaderMap| respond(route.clone(), method, headers);
            router = router.route(path, get(handler));
        }

        let server = serve(listener, router);
        tokio::spawn(async move {
            let _ = server.await;
        });

        Self { base }
    }

    /// The URL of a route, `path` is relative to the server root.
    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }
}

pub fn client(config: &Config) -> ClientWithMiddleware {
    meca_url::build_reqwest_client(config).unwrap()
}

/// A configuration that keeps temporary directories inside `temp_dir`.
pub fn config_in(temp_dir: &std::path::Path) -> Config {
    Config {
        temp_dir: Some(temp_dir.to_path_buf()),
        ..Config::default()
    }
}

pub fn dir_entries(dir: &std::path::Path) -> Vec<String> {
    let mut names = fs_err::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    names
}
