use super::{DocumentStore, ErrorFn, SnapshotFn, Unsubscribe};
use crate::descriptor::QueryDescriptor;
use crate::error::StoreError;
use crate::page::{Cursor, Page};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use surf::{Client, Response, StatusCode};
use utils::surf_logging::SurfLogging;
use utils::url_path::with_segments;
use utils::Url;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    descriptor: &'a QueryDescriptor,
    cursor: Option<&'a Cursor>,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    descriptor: &'a QueryDescriptor,
}

/// Document store reached over JSON/HTTP.
///
/// - `POST {base}/query` with `{descriptor, cursor}` returns a `Page`
/// - `POST {base}/list` with `{descriptor}` returns the whole result set
/// - `GET {base}/documents/{path}/{id}` returns one document
///
/// The backend has no push transport, so live channels poll `list` every
/// `poll_interval` and push a snapshot only when the result set changed.
#[derive(Clone)]
pub struct RestStore {
    http: Client,
    base: Url,
    poll_interval: Duration,
}

impl RestStore {
    pub fn new(base: Url) -> Self {
        Self {
            http: Client::new().with(SurfLogging),
            base,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        with_segments(&self.base, segments.iter().copied())
            .map_err(|err| StoreError::Other(err.to_string()))
    }

    async fn list(
        http: &Client,
        url: Url,
        descriptor: &QueryDescriptor,
    ) -> Result<Vec<Value>, StoreError> {
        let request = http
            .post(url)
            .body_json(&ListRequest { descriptor })
            .map_err(transport)?;
        let response = request.await.map_err(transport)?;
        read_json(response).await
    }
}

fn transport(err: surf::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

async fn read_json<T: DeserializeOwned>(mut response: Response) -> Result<T, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.body_string().await.unwrap_or_default();
        return Err(StoreError::Rejected {
            status: status as u16,
            message,
        });
    }
    response.body_json().await.map_err(transport)
}

#[async_trait]
impl DocumentStore for RestStore {
    async fn query_page(
        &self,
        descriptor: &QueryDescriptor,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, StoreError> {
        let request = self
            .http
            .post(self.url(&["query"])?)
            .body_json(&QueryRequest { descriptor, cursor })
            .map_err(transport)?;
        let response = request.await.map_err(transport)?;
        read_json(response).await
    }

    async fn get_doc_by_id(&self, path: &str, id: &str) -> Result<Value, StoreError> {
        let response = self
            .http
            .get(self.url(&["documents", path, id])?)
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NotFound {
            return Err(StoreError::NotFound {
                path: path.to_string(),
                id: id.to_string(),
            });
        }
        read_json(response).await
    }

    fn subscribe_list(
        &self,
        descriptor: &QueryDescriptor,
        on_snapshot: SnapshotFn,
        on_error: ErrorFn,
    ) -> Result<Unsubscribe, StoreError> {
        let url = self.url(&["list"])?;
        let http = self.http.clone();
        let path = descriptor.collection_path().to_string();
        let descriptor = descriptor.clone();

        let list = move || {
            let http = http.clone();
            let url = url.clone();
            let descriptor = descriptor.clone();
            async move { Self::list(&http, url, &descriptor).await }
        };
        let task = tokio::spawn(follow_list(
            path,
            self.poll_interval,
            list,
            on_snapshot,
            on_error,
        ));

        Ok(Unsubscribe::new(move || task.abort()))
    }
}

/// Poll `list` until it fails. A snapshot is pushed on the first result and
/// whenever the result set differs from the previous one.
async fn follow_list<F, Fut>(
    path: String,
    poll_interval: Duration,
    mut list: F,
    on_snapshot: SnapshotFn,
    on_error: ErrorFn,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Value>, StoreError>>,
{
    let mut last: Option<Vec<Value>> = None;
    loop {
        match list().await {
            Ok(documents) => {
                if last.as_ref() != Some(&documents) {
                    on_snapshot(documents.clone());
                    last = Some(documents);
                }
            }
            Err(err) => {
                log::warn!("Live poll of {} failed: {}", path, err);
                on_error(err);
                return;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one request: headers, then as much body as content-length says.
    async fn read_request(socket: &mut TcpStream) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
            let Some(end) = request.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                return;
            }
        }
    }

    /// Serve one canned response and return the base url to reach it.
    async fn serve_once(status: &'static str, body: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{}/api/", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_missing_document_maps_to_not_found() {
        let store = RestStore::new(serve_once("404 Not Found", "").await);
        assert_eq!(
            store.get_doc_by_id("shops", "zzz").await.unwrap_err(),
            StoreError::NotFound {
                path: "shops".into(),
                id: "zzz".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_status_maps_to_rejected() {
        let store = RestStore::new(serve_once("500 Internal Server Error", "boom").await);
        let descriptor = QueryDescriptor::builder("shops").build().unwrap();
        assert_eq!(
            store.query_page(&descriptor, None).await.unwrap_err(),
            StoreError::Rejected {
                status: 500,
                message: "boom".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_query_page_reads_page_body() {
        let store = RestStore::new(
            serve_once("200 OK", r#"{"items":[{"id":"a"}],"nextCursor":"c1"}"#).await,
        );
        let descriptor = QueryDescriptor::builder("shops").page_size(1).build().unwrap();
        let page = store.query_page(&descriptor, None).await.unwrap();

        assert_eq!(page.items, vec![json!({"id": "a"})]);
        assert_eq!(page.next_cursor, Some(Cursor::new("c1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_pushes_changes_and_stops_on_error() {
        let script = Arc::new(Mutex::new(VecDeque::from(vec![
            Ok(vec![json!({"id": "a"})]),
            Ok(vec![json!({"id": "a"})]),
            Ok(vec![json!({"id": "a"}), json!({"id": "b"})]),
            Err(StoreError::Transport("connection reset".into())),
            Ok(vec![]),
        ])));
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let polls = script.clone();
        let sink = snapshots.clone();
        let error_sink = errors.clone();
        follow_list(
            "shops".into(),
            DEFAULT_POLL_INTERVAL,
            move || {
                let next = polls.lock().unwrap().pop_front();
                async move { next.unwrap_or(Ok(vec![])) }
            },
            Arc::new(move |documents: Vec<Value>| sink.lock().unwrap().push(documents.len())),
            Arc::new(move |err: StoreError| error_sink.lock().unwrap().push(err)),
        )
        .await;

        assert_eq!(*snapshots.lock().unwrap(), vec![1, 2]);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![StoreError::Transport("connection reset".into())]
        );
        // nothing polled after the failure
        assert_eq!(script.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_endpoint_urls() {
        let store = RestStore::new(Url::parse("https://db.example.com/api/").unwrap());
        assert_eq!(
            store.url(&["documents", "shops/london", "a 1"]).unwrap().as_str(),
            "https://db.example.com/api/documents/shops/london/a%201"
        );
        assert_eq!(
            store.url(&["query"]).unwrap().as_str(),
            "https://db.example.com/api/query"
        );
    }

    #[test]
    fn test_query_request_wire_format() {
        let descriptor = QueryDescriptor::builder("shops").page_size(2).build().unwrap();
        let cursor = Cursor::new("c1");
        let body = serde_json::to_value(QueryRequest {
            descriptor: &descriptor,
            cursor: Some(&cursor),
        })
        .unwrap();

        assert_eq!(body["cursor"], "c1");
        assert_eq!(body["descriptor"]["collectionPath"], "shops");
        assert_eq!(body["descriptor"]["pageSize"], 2);
    }
}
