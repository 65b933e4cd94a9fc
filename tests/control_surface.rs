//! Control surface tests over a real TCP connection.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use meteor_watch::api::{ApiConfig, ApiServer};
use meteor_watch::engine::{Engine, EngineConfig, EngineHandle};
use meteor_watch::imops::BgrImage;
use meteor_watch::ingest::{Capture, ReaderOptions, StreamReader};

struct QuietCapture;

impl Capture for QuietCapture {
    fn frame_size(&self) -> (u32, u32) {
        (64, 48)
    }

    fn fps(&self) -> f64 {
        30.0
    }

    fn read(&mut self) -> Result<BgrImage> {
        std::thread::sleep(Duration::from_millis(33));
        let mut img = BgrImage::new(64, 48);
        img.data.fill(20);
        Ok(img)
    }
}

struct Server {
    handle: Arc<EngineHandle>,
    api: Option<meteor_watch::api::ApiHandle>,
    addr: std::net::SocketAddr,
    worker: Option<std::thread::JoinHandle<Result<()>>>,
    _dir: tempfile::TempDir,
}

impl Server {
    fn start(run_engine: bool) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let reader = StreamReader::spawn_with(
            || Ok(Box::new(QuietCapture) as Box<dyn Capture>),
            "test://quiet".to_string(),
            ReaderOptions::default(),
        )?;
        let config = EngineConfig {
            camera_name: "apicam".to_string(),
            output_dir: dir.path().to_path_buf(),
            extract_clips: false,
            ..EngineConfig::default()
        };
        let engine = Engine::with_reader(config, reader, Box::new(|| true))?;
        let handle = engine.handle();
        let worker = if run_engine {
            Some(std::thread::spawn(move || engine.run()))
        } else {
            drop(engine);
            None
        };

        let api = ApiServer::new(
            ApiConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            handle.clone(),
        )
        .spawn()?;
        let addr = api.addr;
        Ok(Self {
            handle,
            api: Some(api),
            addr,
            worker,
            _dir: dir,
        })
    }

    fn request(&self, raw: &str) -> Result<String> {
        let mut stream = TcpStream::connect(self.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(raw.as_bytes())?;
        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        Ok(String::from_utf8_lossy(&response).to_string())
    }

    fn get(&self, path: &str) -> Result<String> {
        self.request(&format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        ))
    }

    fn post(&self, path: &str, body: &str) -> Result<String> {
        self.request(&format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            path,
            body.len(),
            body
        ))
    }

    fn stop(mut self) {
        self.handle.request_shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(api) = self.api.take() {
            let _ = api.stop();
        }
    }
}

fn body_json(response: &str) -> serde_json::Value {
    let body = response
        .split("\r\n\r\n")
        .nth(1)
        .expect("response has a body");
    serde_json::from_str(body).expect("json body")
}

#[test]
fn stats_endpoint_reports_engine_state() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.get("/stats")?;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let stats = body_json(&response);
    assert_eq!(stats["camera"], "apicam");
    assert_eq!(stats["detections"], 0);
    assert_eq!(stats["mask_active"], false);
    assert_eq!(stats["settings"]["sensitivity"], "medium");
    assert_eq!(stats["settings"]["diff_threshold"], 30);
    server.stop();
    Ok(())
}

#[test]
fn settings_update_clamps_and_persists() -> Result<()> {
    let server = Server::start(false)?;

    // Far out of range: must clamp to the documented maximum, not fail.
    let response = server.post("/settings", r#"{"diff_threshold": 9999}"#)?;
    let value = body_json(&response);
    assert_eq!(value["success"], true);
    assert_eq!(value["settings"]["diff_threshold"], 255);

    // Subsequent stats reflect the effective value.
    let stats = body_json(&server.get("/stats")?);
    assert_eq!(stats["settings"]["diff_threshold"], 255);

    // Idempotence: re-applying the same patch changes nothing.
    let again = body_json(&server.post("/settings", r#"{"diff_threshold": 9999}"#)?);
    assert_eq!(again["settings"], stats["settings"]);
    server.stop();
    Ok(())
}

#[test]
fn settings_get_mirrors_update_response_shape() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.get("/settings")?;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let value = body_json(&response);
    assert_eq!(value["success"], true);
    assert_eq!(value["settings"]["sensitivity"], "medium");
    assert_eq!(value["settings"]["diff_threshold"], 30);

    // The read-back reflects updates the same way POST /settings does.
    server.post("/settings", r#"{"min_speed": 42.0}"#)?;
    let value = body_json(&server.get("/settings")?);
    assert_eq!(value["settings"]["min_speed"], 42.0);
    server.stop();
    Ok(())
}

#[test]
fn sensitivity_patch_applies_preset_with_overrides() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.post(
        "/settings",
        r#"{"sensitivity": "fireball", "min_speed": 33.0}"#,
    )?;
    let value = body_json(&response);
    assert_eq!(value["success"], true);
    assert_eq!(value["settings"]["sensitivity"], "fireball");
    assert_eq!(value["settings"]["min_brightness"], 150);
    assert_eq!(value["settings"]["min_speed"], 33.0);
    server.stop();
    Ok(())
}

#[test]
fn snapshot_is_unavailable_before_first_frame_pair() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.get("/snapshot")?;
    assert!(response.starts_with("HTTP/1.1 503"));
    server.stop();
    Ok(())
}

#[test]
fn snapshot_serves_jpeg_once_frames_flow() -> Result<()> {
    let server = Server::start(true)?;
    // Wait for the first frame pair to hit the display slot.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = server.get("/snapshot")?;
        if response.starts_with("HTTP/1.1 200") {
            assert!(response.contains("image/jpeg"));
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("snapshot never became available");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    server.stop();
    Ok(())
}

#[test]
fn restart_endpoint_sets_shutdown_flag() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.post("/restart", "")?;
    assert!(response.starts_with("HTTP/1.1 202"));
    let value = body_json(&response);
    assert_eq!(value["success"], true);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !server.handle.shutdown_requested() {
        if std::time::Instant::now() > deadline {
            panic!("shutdown flag never set");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    server.stop();
    Ok(())
}

#[test]
fn mask_endpoints_roundtrip() -> Result<()> {
    let server = Server::start(false)?;
    // No mask yet.
    let response = server.get("/mask")?;
    assert!(response.starts_with("HTTP/1.1 404"));

    let mut mask = meteor_watch::imops::GrayImage::new(32, 24);
    for x in 0..32 {
        mask.put(x, 20, 255);
    }
    server.handle.masks.set_exclusion(Some(mask));

    let response = server.get("/mask?alpha=200")?;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("image/png"));

    let value = body_json(&server.post("/reset_mask", "")?);
    assert_eq!(value["success"], true);
    assert!(!server.handle.masks.exclusion_active());
    server.stop();
    Ok(())
}

#[test]
fn unknown_route_is_404() -> Result<()> {
    let server = Server::start(false)?;
    let response = server.get("/nope")?;
    assert!(response.starts_with("HTTP/1.1 404"));
    server.stop();
    Ok(())
}
