use heatmap_app::models::PointerKind;
use heatmap_app::tracker::{
    BEACON_QUEUE_DEPTH, Delivery, HeatmapTracker, HttpDelivery, MemorySessionStorage,
    PointerEvent, Rect, ScrollMetrics, TrackedRoot, TrackerOptions, deliver,
};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestServer {
    base_url: String,
    child: Child,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static SERVER: Lazy<Mutex<Option<Arc<TestServer>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(unix)]
mod cleanup {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Once;

    static REGISTER: Once = Once::new();
    static PID: AtomicI32 = AtomicI32::new(0);

    pub fn register(pid: u32) {
        REGISTER.call_once(|| {
            PID.store(pid as i32, Ordering::SeqCst);
            unsafe {
                libc::atexit(on_exit);
            }
        });
    }

    extern "C" fn on_exit() {
        let pid = PID.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn unique_suffix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}_{}", std::process::id(), nanos)
}

fn unique_data_path() -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("heatmap_app_http_{}.json", unique_suffix()));
    path.to_string_lossy().to_string()
}

async fn wait_until_ready(base_url: &str) {
    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(resp) = client.get(format!("{base_url}/api/health")).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("server did not become ready");
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn spawn_server() -> TestServer {
    let port = pick_free_port();
    let child = Command::new(env!("CARGO_BIN_EXE_heatmap_app"))
        .env("PORT", port.to_string())
        .env("APP_DATA_PATH", unique_data_path())
        .env("HEATMAP_BACKEND", "file")
        .env("HEATMAP_ADMIN_TOKEN", ADMIN_TOKEN)
        .env("RUST_LOG", "info")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn server");

    #[cfg(unix)]
    cleanup::register(child.id());

    let base_url = format!("http://127.0.0.1:{port}");
    wait_until_ready(&base_url).await;

    TestServer { base_url, child }
}

async fn shared_server() -> Arc<TestServer> {
    let mut guard = SERVER.lock().await;
    if let Some(server) = guard.as_ref() {
        return Arc::clone(server);
    }
    let server = Arc::new(spawn_server().await);
    *guard = Some(Arc::clone(&server));
    server
}

async fn snapshot(client: &Client, base_url: &str, slug: &str) -> Value {
    client
        .get(format!("{base_url}/api/heatmap/snapshot"))
        .query(&[("slug", slug)])
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn bucket<'a>(snapshot: &'a Value, label: &str) -> &'a Value {
    snapshot["buckets"]
        .as_array()
        .unwrap()
        .iter()
        .find(|bucket| bucket["viewportBucket"] == label)
        .expect("missing viewport bucket")
}

#[tokio::test]
async fn http_ingest_then_snapshot() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let response = client
        .post(format!("{}/api/heatmap", server.base_url))
        .json(&json!({
            "slug": "abc",
            "viewportBucket": "md",
            "sessionId": "0123456789abcdef0123456789abcdef",
            "pointer": [{ "area": "zoneA", "type": "down", "x": 0, "y": 0, "count": 3 }],
            "scroll": [],
            "sentAt": "2026-01-05T10:00:00Z",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(response.headers().get("set-cookie").is_some());

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["slug"], "abc");
    assert_eq!(body["stored"], true);
    assert_eq!(body["backend"], "file");
    assert_eq!(body["count"], 1);

    let snapshot = snapshot(&client, &server.base_url, "abc").await;
    assert_eq!(snapshot["slug"], "abc");
    let md = bucket(&snapshot, "md");
    assert!(md["cells"][0][0].as_u64().unwrap() >= 3);
    assert!(md["areas"]["zoneA"].as_u64().unwrap() >= 3);
    assert!(md["viewers"].as_u64().unwrap() <= md["samples"].as_u64().unwrap());
}

#[tokio::test]
async fn http_rejects_bad_requests() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/api/heatmap", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get("allow").unwrap(), "POST");
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    let response = client
        .post(format!("{}/api/heatmap", server.base_url))
        .json(&json!({ "slug": "  ", "pointer": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "slug is required");

    let response = client
        .post(format!("{}/api/heatmap", server.base_url))
        .header("content-type", "application/json")
        .body("{broken")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_reads_require_admin_token() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();

    for path in ["/api/heatmap/snapshot?slug=abc", "/api/heatmap/summary"] {
        let response = client
            .get(format!("{}{path}", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = client
            .get(format!("{}{path}", server.base_url))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn http_same_viewer_counts_once_in_summary() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::builder().cookie_store(true).build().unwrap();
    let slug = format!("dedup-{}", unique_suffix());

    for _ in 0..2 {
        let response = client
            .post(format!("{}/api/heatmap", server.base_url))
            .json(&json!({
                "slug": slug,
                "viewportBucket": "xl",
                "pointer": [
                    { "area": "hero", "type": "move", "x": 5, "y": 3, "count": 3 },
                    { "area": "cta", "type": "down", "x": 11, "y": 7, "count": 1 },
                ],
                "scroll": [{ "bucket": 7, "count": 1 }],
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    let summary: Value = client
        .get(format!("{}/api/heatmap/summary", server.base_url))
        .query(&[("slug", slug.as_str()), ("limit", "1")])
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(summary["generatedAt"].is_string());
    assert!(
        summary["availableSlugs"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == slug.as_str())
    );
    let entry = &summary["slugs"][0];
    assert_eq!(entry["slug"], slug.as_str());
    assert_eq!(entry["samples"], 2);
    assert_eq!(entry["viewers"], 1);
    assert_eq!(entry["interactions"], 10);
    assert_eq!(entry["topZones"].as_array().unwrap().len(), 1);
    assert_eq!(entry["topZones"][0]["key"], "hero");
    assert_eq!(entry["topZones"][0]["share"], 0.6);
    assert_eq!(entry["topCells"][0]["x"], 5);
    assert_eq!(entry["topCells"][0]["y"], 3);
}

async fn post_batch(client: &Client, base_url: &str, slug: &str) {
    let response = client
        .post(format!("{base_url}/api/heatmap"))
        .json(&json!({
            "slug": slug,
            "viewportBucket": "lg",
            "pointer": [{ "area": "nav", "type": "down", "x": 1, "y": 0, "count": 1 }],
            "scroll": [],
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn http_summary_accepts_repeated_slug_keys() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let suffix = unique_suffix();
    let (a, b, c) = (format!("rep-a-{suffix}"), format!("rep-b-{suffix}"), format!("rep-c-{suffix}"));
    for slug in [&a, &b, &c] {
        post_batch(&client, &server.base_url, slug).await;
    }

    let both = format!("{b},{c}");
    let response = client
        .get(format!("{}/api/heatmap/summary", server.base_url))
        .query(&[("slug", a.as_str()), ("slug", both.as_str())])
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary: Value = response.json().await.unwrap();
    let slugs: Vec<&str> = summary["slugs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["slug"].as_str().unwrap())
        .collect();
    assert_eq!(slugs, vec![a.as_str(), b.as_str(), c.as_str()]);
    assert!(summary["slugs"].as_array().unwrap().iter().all(|e| e["samples"] == 1));

    let response = client
        .get(format!("{}/api/heatmap/snapshot", server.base_url))
        .query(&[("slug", a.as_str()), ("slug", b.as_str())])
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot: Value = response.json().await.unwrap();
    assert_eq!(snapshot["slug"], a.as_str());
}

#[tokio::test]
async fn http_snapshot_rejects_unknown_bucket_label() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let client = Client::new();
    let slug = format!("label-{}", unique_suffix());
    post_batch(&client, &server.base_url, &slug).await;

    let response = client
        .get(format!("{}/api/heatmap/snapshot", server.base_url))
        .query(&[("slug", slug.as_str()), ("bucket", "tablet")])
        .header("x-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("tablet"));
}

struct PageRoot;

impl TrackedRoot for PageRoot {
    fn bounding_rect(&self) -> Rect {
        Rect {
            left: 0.0,
            top: 0.0,
            width: 1200.0,
            height: 800.0,
        }
    }

    fn scroll_metrics(&self) -> ScrollMetrics {
        ScrollMetrics {
            scroll_y: 0.0,
            document_height: 800.0,
            viewport_height: 800.0,
        }
    }

    fn viewport_width(&self) -> f64 {
        1440.0
    }
}

#[tokio::test]
async fn http_tracker_delivers_on_detach() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let slug = format!("tracked-{}", unique_suffix());

    let (delivery, worker) =
        HttpDelivery::spawn(format!("{}/api/heatmap", server.base_url)).unwrap();
    let mut tracker = HeatmapTracker::attach(
        PageRoot,
        MemorySessionStorage::default(),
        delivery,
        TrackerOptions {
            slug: slug.clone(),
            enabled: true,
        },
    );

    let path = [Some("video-player")];
    for i in 0..12u64 {
        let event = PointerEvent {
            client_x: 550.0,
            client_y: 350.0,
            timestamp_ms: i * 4,
            zone_path: &path,
        };
        tracker.on_pointer(&event, PointerKind::Move);
    }
    tracker.on_scroll(100);
    drop(tracker);
    worker.await.unwrap();

    let client = Client::new();
    let snapshot = snapshot(&client, &server.base_url, &slug).await;
    let xl = bucket(&snapshot, "xl");
    assert_eq!(xl["cells"][3][5], 1);
    assert_eq!(xl["areas"]["video-player"], 1);
    assert_eq!(xl["scroll"][0], 1);
    assert_eq!(xl["samples"], 1);
}

fn batch_body(slug: &str) -> String {
    json!({
        "slug": slug,
        "viewportBucket": "sm",
        "sessionId": "queue-session",
        "pointer": [{ "area": "footer", "type": "move", "x": 0, "y": 7, "count": 1 }],
        "scroll": [],
    })
    .to_string()
}

#[tokio::test]
async fn http_full_beacon_queue_falls_back_to_keepalive() {
    let _guard = TEST_LOCK.lock().await;
    let server = shared_server().await;
    let suffix = unique_suffix();
    let queued = format!("queued-{suffix}");
    let overflow = format!("overflow-{suffix}");

    let (delivery, worker) =
        HttpDelivery::spawn(format!("{}/api/heatmap", server.base_url)).unwrap();
    // Nothing awaits in between, so the worker cannot drain yet.
    for _ in 0..BEACON_QUEUE_DEPTH {
        assert!(delivery.send_beacon(&batch_body(&queued)).unwrap());
    }
    assert!(!delivery.send_beacon(&batch_body(&overflow)).unwrap());
    assert!(deliver(&delivery, batch_body(&overflow)));
    drop(delivery);
    worker.await.unwrap();

    let client = Client::new();
    let queued_snapshot = snapshot(&client, &server.base_url, &queued).await;
    assert_eq!(bucket(&queued_snapshot, "sm")["samples"], BEACON_QUEUE_DEPTH as u64);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let snapshot = snapshot(&client, &server.base_url, &overflow).await;
        if snapshot["buckets"].as_array().is_some_and(|b| !b.is_empty()) {
            let sm = bucket(&snapshot, "sm");
            assert_eq!(sm["samples"], 1);
            assert_eq!(sm["cells"][7][0], 1);
            break;
        }
        if Instant::now() > deadline {
            panic!("keepalive batch never arrived");
        }
        sleep(Duration::from_millis(50)).await;
    }
}
