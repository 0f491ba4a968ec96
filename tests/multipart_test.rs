//! Multipart adapter integration tests
//!
//! Covers the single-request form upload, the item list and the event bus.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use resumable_uploadr::source::{ByteSource, MemorySource};
    use resumable_uploadr::upload::multipart::{ItemEvent, ItemEventKind, ItemStatus};
    use resumable_uploadr::upload::{
        MultipartConfig, MultipartUploader, UploadError, UploadHooks, Uploader,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader(server: &MockServer) -> MultipartUploader {
        MultipartUploader::new(MultipartConfig::new(format!("{}/form", server.uri()))).unwrap()
    }

    /// Source that records every range it is asked for
    struct RecordingSource {
        inner: MemorySource,
        reads: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl ByteSource for RecordingSource {
        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn name(&self) -> &str {
            self.inner.name()
        }

        fn content_type(&self) -> &str {
            self.inner.content_type()
        }

        async fn slice(&self, start: u64, end: u64) -> Result<Bytes, UploadError> {
            self.reads.lock().push((start, end));
            self.inner.slice(start, end).await
        }
    }

    /// Collect events until the first terminal one
    async fn collect_until_done(events: &mut broadcast::Receiver<ItemEvent>) -> Vec<ItemEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("no terminal event")
                .unwrap();
            let done = matches!(event.kind, ItemEventKind::Finish | ItemEventKind::Error);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_non_json_response_falls_back_to_source() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = uploader(&server);
        let source = MemorySource::new("hello.txt", &b"Hello, World!"[..])
            .with_content_type("text/plain");
        let meta = uploader.upload(Arc::new(source)).await.unwrap();

        assert_eq!(meta.name, "hello.txt");
        assert_eq!(meta.original_name, "hello.txt");
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.size, 13);
        assert_eq!(meta.bytes_written, 13);

        let items = uploader.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, meta.id);
        assert_eq!(items[0].status, ItemStatus::Completed);
        assert_eq!(items[0].completed, 100);
    }

    #[tokio::test]
    async fn test_json_response_and_form_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", "/files/f-1")
                    .set_body_json(json!({"id": "f-1", "size": 4})),
            )
            .mount(&server)
            .await;

        let mut config = MultipartConfig::new(format!("{}/form", server.uri()));
        config.metadata.insert("project".into(), "demo".into());
        let uploader = MultipartUploader::new(config).unwrap();

        let meta = uploader
            .upload(Arc::new(MemorySource::new("a.bin", &b"abcd"[..])))
            .await
            .unwrap();
        assert_eq!(meta.id, "f-1");
        assert_eq!(meta.url, Some(format!("{}/files/f-1", server.uri())));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body).to_string();
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("filename=\"a.bin\""));
        assert!(body.contains("name=\"metadata\""));
        assert!(body.contains("abcd"));
        let header = requests[0].headers.get("X-File-Metadata").unwrap();
        assert_eq!(header.to_str().unwrap(), r#"{"project":"demo"}"#);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let errors = Arc::new(AtomicUsize::new(0));
        let hooks = {
            let errors = errors.clone();
            UploadHooks::new().on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let uploader = uploader(&server).with_hooks(hooks);

        let result = uploader
            .upload(Arc::new(MemorySource::new("a", &b"a"[..])))
            .await;
        assert!(matches!(result, Err(UploadError::Http { status: 500, .. })));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let items = uploader.items();
        assert_eq!(items[0].status, ItemStatus::Error);
        assert!(items[0].error.is_some());
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let uploader = uploader(&server);
        let mut events = uploader.subscribe();
        // Several progress slices
        let id = uploader.add(Arc::new(MemorySource::new("big", vec![1u8; 200 * 1024])));

        let seen = collect_until_done(&mut events).await;
        assert!(seen.iter().all(|e| e.item.id == id));
        assert_eq!(seen.first().unwrap().kind, ItemEventKind::Start);
        assert_eq!(seen.last().unwrap().kind, ItemEventKind::Finish);

        let progress: Vec<u64> = seen
            .iter()
            .filter(|e| e.kind == ItemEventKind::Progress)
            .map(|e| e.item.loaded)
            .collect();
        assert!(progress.len() >= 2);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), 200 * 1024);

        let item = uploader.item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.upload_response.is_some());
    }

    #[tokio::test]
    async fn test_body_is_read_in_bounded_slices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let total = 200 * 1024u64;
        let source = Arc::new(RecordingSource {
            inner: MemorySource::new("big.bin", vec![9u8; total as usize]),
            reads: Mutex::new(Vec::new()),
        });

        let uploader = uploader(&server);
        let meta = uploader.upload(source.clone()).await.unwrap();
        assert_eq!(meta.size, total);

        let reads = source.reads.lock().clone();
        assert_eq!(
            reads,
            vec![
                (0, 64 * 1024),
                (64 * 1024, 128 * 1024),
                (128 * 1024, 192 * 1024),
                (192 * 1024, total),
            ]
        );

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].body.len() as u64 > total);
    }

    #[tokio::test]
    async fn test_abort_item() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let uploader = uploader(&server);
        let mut events = uploader.subscribe();
        let id = uploader.add(Arc::new(MemorySource::new("a", &b"abc"[..])));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(uploader.abort_item(&id));
        assert!(!uploader.abort_item(&id));

        let seen = collect_until_done(&mut events).await;
        let last = seen.last().unwrap();
        assert_eq!(last.kind, ItemEventKind::Error);
        assert!(matches!(last.error, Some(UploadError::Aborted)));
        assert_eq!(uploader.item(&id).unwrap().status, ItemStatus::Aborted);
    }

    #[tokio::test]
    async fn test_abort_all_and_clear() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let uploader = Arc::new(uploader(&server));
        let task = {
            let uploader = uploader.clone();
            tokio::spawn(async move {
                uploader
                    .upload(Arc::new(MemorySource::new("a", &b"abc"[..])))
                    .await
            })
        };
        uploader.add(Arc::new(MemorySource::new("b", &b"def"[..])));

        tokio::time::sleep(Duration::from_millis(200)).await;
        uploader.abort();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("abort did not stop the upload")
            .unwrap();
        assert!(matches!(result, Err(UploadError::Aborted)));

        let seen = server.received_requests().await.unwrap().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), seen);

        uploader.clear();
        assert!(uploader.items().is_empty());
    }
}
