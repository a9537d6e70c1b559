//! Plumbing shared by the three service clients: client construction,
//! status handling and the paged listing envelope.

use std::collections::HashSet;

use reqwest::{header::HeaderMap, Client, ClientBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    config::Transport,
    error::{Error, RemoteError, Result},
};

/// Applies the proxy and certificate settings to a builder.
pub(crate) fn builder(transport: &Transport, headers: HeaderMap) -> Result<ClientBuilder> {
    let mut builder = Client::builder().default_headers(headers);
    if let Some(proxy) = &transport.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| Error::Config(format!("invalid proxy url {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    if transport.accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder)
}

pub(crate) fn build_client(transport: &Transport, headers: HeaderMap) -> Result<Client> {
    Ok(builder(transport, headers)?.build()?)
}

/// Passes 2xx responses through, turns everything else into `RemoteRequest`.
pub(crate) async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::RemoteRequest(RemoteError {
        status: status.as_u16(),
        url,
        body,
    }))
}

pub(crate) async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let bytes = ensure_success(resp).await?.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// A listing response: either a `results` page with a `next` link or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Listing<T> {
    Page {
        results: Vec<T>,
        #[serde(default)]
        next: Option<String>,
    },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    pub(crate) fn into_parts(self) -> (Vec<T>, Option<String>) {
        match self {
            Listing::Page { results, next } => (results, next),
            Listing::Plain(results) => (results, None),
        }
    }
}

pub(crate) async fn fetch_page<T: DeserializeOwned>(
    client: &Client,
    url: &str,
) -> Result<(Vec<T>, Option<String>)> {
    let listing: Listing<T> = read_json(client.get(url).send().await?).await?;
    Ok(listing.into_parts())
}

/// Follows `next` links until the listing is exhausted.
///
/// A `next` link pointing back at an already fetched page is an error.
pub(crate) async fn fetch_all<T: DeserializeOwned>(client: &Client, url: &str) -> Result<Vec<T>> {
    let mut visited = HashSet::from([url.to_string()]);
    let (mut items, mut next) = fetch_page(client, url).await?;
    while let Some(url) = next {
        if !visited.insert(url.clone()) {
            return Err(Error::RemoteRequest(RemoteError {
                status: 200,
                url,
                body: "next link repeats an already fetched page".into(),
            }));
        }
        let (page, following) = fetch_page(client, &url).await?;
        items.extend(page);
        next = following;
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn follows_next_links() {
        let server = MockServer::start();
        let second = server.mock(|when, then| {
            when.method(GET).path("/items/page-2");
            then.status(200)
                .json_body(json!({"results": [3], "next": null}));
        });
        let first = server.mock(|when, then| {
            when.method(GET).path("/items/");
            then.status(200).json_body(
                json!({"results": [1, 2], "next": server.url("/items/page-2")}),
            );
        });

        let client = build_client(&Transport::default(), HeaderMap::new()).unwrap();
        let items: Vec<u32> = fetch_all(&client, &server.url("/items/")).await.unwrap();

        assert_eq!(items, vec![1, 2, 3]);
        first.assert();
        second.assert();
    }

    #[tokio::test]
    async fn repeated_next_link_stops_paging() {
        let server = MockServer::start();
        let looping = server.mock(|when, then| {
            when.method(GET).path("/items/page-2");
            then.status(200)
                .json_body(json!({"results": [3], "next": server.url("/items/page-2")}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/items/");
            then.status(200).json_body(
                json!({"results": [1, 2], "next": server.url("/items/page-2")}),
            );
        });

        let client = build_client(&Transport::default(), HeaderMap::new()).unwrap();
        let err = fetch_all::<u32>(&client, &server.url("/items/"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RemoteRequest(ref remote) if remote.url.ends_with("/items/page-2")));
        looping.assert_hits(1);
    }

    #[test]
    fn malformed_proxy_is_a_config_error() {
        let transport = Transport {
            proxy: Some("http://[::1".into()),
            accept_invalid_certs: false,
        };
        let err = builder(&transport, HeaderMap::new()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let transport = Transport {
            proxy: Some("http://proxy.local:3128".into()),
            accept_invalid_certs: true,
        };
        assert!(builder(&transport, HeaderMap::new()).is_ok());
    }

    #[tokio::test]
    async fn accepts_bare_arrays() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/labels");
            then.status(200).json_body(json!([{"id": 1}, {"id": 2}]));
        });

        let client = build_client(&Transport::default(), HeaderMap::new()).unwrap();
        let items: Vec<serde_json::Value> =
            fetch_all(&client, &server.url("/labels")).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn non_success_carries_status_and_body() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/broken");
            then.status(503).body("maintenance");
        });

        let client = build_client(&Transport::default(), HeaderMap::new()).unwrap();
        let err = fetch_all::<u32>(&client, &server.url("/broken"))
            .await
            .unwrap_err();
        match err {
            Error::RemoteRequest(remote) => {
                assert_eq!(remote.status, 503);
                assert_eq!(remote.body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
