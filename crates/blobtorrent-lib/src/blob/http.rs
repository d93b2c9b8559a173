use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use super::{BlobClient, BlobError, BlobRef, SizedBlobRef};

const DEFAULT_STAT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    received: Vec<SizedBlobRef>,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(default)]
    stat: Vec<SizedBlobRef>,
}

/// Talks to a Camlistore (Perkeep) compatible blob server over HTTP
#[derive(Debug, Clone)]
pub struct HttpBlobClient {
    http_client: reqwest::Client,
    base_url: Url,
    stat_batch_size: usize,
}

impl HttpBlobClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("building reqwest client")?;

        Ok(HttpBlobClient::with_http_client(http_client, base_url))
    }

    pub fn with_http_client(http_client: reqwest::Client, mut base_url: Url) -> Self {
        // Url::join drops the last path segment unless the base ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        HttpBlobClient {
            http_client,
            base_url,
            stat_batch_size: DEFAULT_STAT_BATCH_SIZE,
        }
    }

    /// Maximum number of blobrefs sent in a single stat request
    pub fn with_stat_batch_size(mut self, stat_batch_size: usize) -> Self {
        self.stat_batch_size = stat_batch_size.max(1);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, BlobError> {
        self.base_url
            .join(path)
            .map_err(|e| BlobError::BadResponse(format!("bad blob server endpoint '{path}': {e}")))
    }
}

#[async_trait]
impl BlobClient for HttpBlobClient {
    #[tracing::instrument(level = "error", err(level = "debug"), skip_all, fields(%blob_ref))]
    async fn fetch(&self, blob_ref: &BlobRef) -> Result<Bytes, BlobError> {
        let url = self.endpoint(&format!("camli/{blob_ref}"))?;
        let response = self.http_client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(*blob_ref));
        }

        let mut response = response.error_for_status()?;
        let capacity = response
            .content_length()
            .and_then(|length| usize::try_from(length).ok())
            .unwrap_or_default();
        let mut blob = BytesMut::with_capacity(capacity);
        while let Some(chunk) = response.chunk().await? {
            blob.extend_from_slice(&chunk);
        }

        Ok(blob.freeze())
    }

    #[tracing::instrument(level = "error", err(level = "debug"), skip_all, fields(%blob_ref, size = data.len()))]
    async fn receive_blob(&self, blob_ref: &BlobRef, data: Bytes) -> Result<SizedBlobRef, BlobError> {
        let url = self.endpoint("camli/upload")?;
        let name = blob_ref.to_string();
        let part = Part::bytes(data.to_vec())
            .file_name(name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(name, part);

        let response: UploadResponse = self
            .http_client
            .post(url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .received
            .into_iter()
            .next()
            .ok_or_else(|| BlobError::BadResponse(format!("upload of {blob_ref} wasn't acknowledged")))
    }

    #[tracing::instrument(level = "error", err(level = "debug"), skip_all, fields(blobs = blob_refs.len()))]
    async fn stat_blobs(
        &self,
        blob_refs: &[BlobRef],
        existing: mpsc::Sender<SizedBlobRef>,
    ) -> Result<(), BlobError> {
        let url = self.endpoint("camli/stat")?;
        for batch in blob_refs.chunks(self.stat_batch_size) {
            let form = stat_form(batch);
            let response: StatResponse = self
                .http_client
                .post(url.clone())
                .form(&form)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            tracing::trace!(requested = batch.len(), existing = response.stat.len(), "stat batch done");
            for sized_blob_ref in response.stat {
                existing
                    .send(sized_blob_ref)
                    .await
                    .map_err(|_| BlobError::ReceiverDropped)?;
            }
        }

        Ok(())
    }
}

fn stat_form(blob_refs: &[BlobRef]) -> Vec<(String, String)> {
    let mut form = Vec::with_capacity(blob_refs.len() + 1);
    form.push(("camliversion".to_string(), "1".to_string()));
    form.extend(
        blob_refs
            .iter()
            .enumerate()
            .map(|(idx, blob_ref)| (format!("blob{}", idx + 1), blob_ref.to_string())),
    );
    form
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Serves every request with `handler(request line, body)`, which returns a raw HTTP response
    async fn serve<H>(handler: H) -> HttpBlobClient
    where
        H: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind a listener");
        let addr = listener.local_addr().expect("no local address");
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let Ok((request_line, body)) = read_request(&mut stream).await else {
                        return;
                    };
                    let response = handler(&request_line, &body);
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let http_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("failed to build a reqwest client");
        HttpBlobClient::with_http_client(http_client, Url::parse(&format!("http://{addr}/bs")).expect("bad url"))
    }

    async fn read_request(stream: &mut TcpStream) -> std::io::Result<(String, String)> {
        let mut request = Vec::new();
        let mut buf = [0; 4096];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                return Ok((String::new(), String::new()));
            }
            request.extend_from_slice(&buf[..read]);

            let Some(header_end) = request.windows(4).position(|window| window == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
            let body = &request[header_end + 4..];
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|length| length.trim().parse::<usize>().ok());
            let complete = match content_length {
                Some(length) => body.len() >= length,
                None if head.contains("transfer-encoding: chunked") => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };

            if complete {
                let request_line = head.lines().next().unwrap_or_default().to_string();
                return Ok((request_line, String::from_utf8_lossy(body).into_owned()));
            }
        }
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Blobrefs sent in a stat form body
    fn requested_blob_refs(body: &str) -> Vec<String> {
        body.split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(key, _)| key.starts_with("blob"))
            .map(|(_, value)| value.to_string())
            .collect()
    }

    #[tokio::test]
    async fn fetch_assembles_a_chunked_body() {
        let blob_ref = BlobRef::sha1_from_bytes(b"abcde");
        let expected_line = format!("get /bs/camli/{blob_ref} http/1.1");
        let client = serve(move |request_line, _| {
            assert_eq!(request_line, expected_line);
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"
                .to_string()
        })
        .await;

        let blob = client.fetch(&blob_ref).await.expect("fetch failed");

        assert_eq!(blob, Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn missing_blobs_are_not_found() {
        let client = serve(|_, _| json_response("404 Not Found", "")).await;
        let blob_ref = BlobRef::sha1_from_bytes(b"missing");

        let result = client.fetch(&blob_ref).await;

        assert!(matches!(result, Err(BlobError::NotFound(missing)) if missing == blob_ref));
    }

    #[tokio::test]
    async fn stat_is_split_into_batches() {
        let existing = [BlobRef::sha1_from_bytes(b"first"), BlobRef::sha1_from_bytes(b"third")];
        let existing_names = existing.map(|blob_ref| blob_ref.to_string());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

        let client = serve(move |request_line, body| {
            assert!(request_line.starts_with("post /bs/camli/stat"));
            counter.fetch_add(1, Ordering::SeqCst);
            let stat = requested_blob_refs(body)
                .into_iter()
                .filter(|blob_ref| existing_names.contains(blob_ref))
                .map(|blob_ref| format!(r#"{{"blobRef": "{blob_ref}", "size": 5}}"#))
                .collect::<Vec<_>>()
                .join(",");
            json_response("200 OK", &format!(r#"{{"stat": [{stat}]}}"#))
        })
        .await
        .with_stat_batch_size(2);

        let blob_refs = [
            existing[0],
            BlobRef::sha1_from_bytes(b"second"),
            existing[1],
        ];
        let (tx, mut rx) = mpsc::channel(8);
        client.stat_blobs(&blob_refs, tx).await.expect("stat request failed");

        let mut found = Vec::new();
        while let Some(sized_blob_ref) = rx.recv().await {
            found.push(sized_blob_ref.blob_ref);
        }

        assert_eq!(found, existing);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stat_fails_when_the_receiver_is_gone() {
        let existing = BlobRef::sha1_from_bytes(b"first");
        let client = serve(move |_, _| {
            json_response("200 OK", &format!(r#"{{"stat": [{{"blobRef": "{existing}", "size": 5}}]}}"#))
        })
        .await;

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = client.stat_blobs(&[existing], tx).await;

        assert!(matches!(result, Err(BlobError::ReceiverDropped)));
    }

    #[tokio::test]
    async fn unacknowledged_uploads_are_rejected() {
        let client = serve(|request_line, _| {
            assert!(request_line.starts_with("post /bs/camli/upload"));
            json_response("200 OK", r#"{"received": []}"#)
        })
        .await;
        let data = Bytes::from_static(b"piece");

        let result = client
            .receive_blob(&BlobRef::sha1_from_bytes(&data), data)
            .await;

        assert!(matches!(result, Err(BlobError::BadResponse(_))));
    }

    #[tokio::test]
    async fn uploads_return_the_received_blobref() {
        let data = Bytes::from_static(b"piece");
        let blob_ref = BlobRef::sha1_from_bytes(&data);
        let client = serve(move |_, body| {
            // The multipart part is named after the blobref
            assert!(body.contains(&format!("name=\"{blob_ref}\"")));
            json_response(
                "200 OK",
                &format!(r#"{{"received": [{{"blobRef": "{blob_ref}", "size": 5}}]}}"#),
            )
        })
        .await;

        let received = client.receive_blob(&blob_ref, data).await.expect("upload failed");

        assert_eq!(received, SizedBlobRef { blob_ref, size: 5 });
    }

    #[test]
    fn stat_form_numbers_blobs_from_one() {
        let first = BlobRef::sha1_from_bytes(b"first");
        let second = BlobRef::sha1_from_bytes(b"second");

        let form = stat_form(&[first, second]);

        assert_eq!(
            form,
            vec![
                ("camliversion".to_string(), "1".to_string()),
                ("blob1".to_string(), first.to_string()),
                ("blob2".to_string(), second.to_string()),
            ]
        );
    }

    #[test]
    fn parses_stat_response() {
        let existing = BlobRef::sha1_from_bytes(b"piece");
        let body = format!(r#"{{"stat": [{{"blobRef": "{existing}", "size": 5}}], "canLongPoll": true}}"#);

        let response: StatResponse = serde_json::from_str(&body).expect("failed to parse a stat response");

        assert_eq!(
            response.stat,
            vec![SizedBlobRef {
                blob_ref: existing,
                size: 5
            }]
        );
    }

    #[test]
    fn parses_stat_response_without_existing_blobs() {
        let response: StatResponse =
            serde_json::from_str(r#"{"canLongPoll": false}"#).expect("failed to parse a stat response");
        assert!(response.stat.is_empty());
    }

    #[test]
    fn parses_upload_response() {
        let received = BlobRef::sha1_from_bytes(b"piece");
        let body = format!(r#"{{"received": [{{"blobRef": "{received}", "size": 5}}]}}"#);

        let response: UploadResponse = serde_json::from_str(&body).expect("failed to parse an upload response");

        assert_eq!(response.received[0].blob_ref, received);
    }

    #[test]
    fn endpoints_are_relative_to_the_base_path() {
        let client = HttpBlobClient::new(Url::parse("http://localhost:3179/bs").expect("bad url"))
            .expect("failed to create a client");
        let url = client.endpoint("camli/stat").expect("failed to build an endpoint");
        assert_eq!(url.as_str(), "http://localhost:3179/bs/camli/stat");
    }
}
