//! Per-camera HTTP control surface.
//!
//! A deliberately small HTTP server over `TcpListener`: the accept loop
//! runs non-blocking on one thread and each connection is handled on its
//! own thread, so a long-lived MJPEG stream never starves the JSON
//! endpoints.
//!
//! Endpoints:
//! - `GET /`            tiny live-preview page
//! - `GET /stream`      MJPEG of the annotated live frame
//! - `GET /snapshot`    single JPEG of the current frame
//! - `GET /stats`       stats snapshot as JSON
//! - `GET /settings`    effective detection settings
//! - `GET /mask`        current exclusion mask as a translucent PNG overlay
//! - `POST /update_mask` synthesize a mask from the current frame
//! - `POST /reset_mask`  clear the mask and delete the persisted file
//! - `POST /settings`    clamped partial update of detection parameters
//! - `POST /restart`     set the engine shutdown flag

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error};
use serde_json::json;

use crate::engine::EngineHandle;
use crate::media::encode_jpeg;
use crate::params::ParamsPatch;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_JPEG_QUALITY: u8 = 70;
const SNAPSHOT_JPEG_QUALITY: u8 = 90;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    engine: Arc<EngineHandle>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, engine: Arc<EngineHandle>) -> Self {
        Self { cfg, engine }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let engine = self.engine;

        let join = std::thread::spawn(move || {
            while !shutdown_thread.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let engine = engine.clone();
                        let shutdown = shutdown_thread.clone();
                        std::thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, &engine, &shutdown) {
                                debug!("connection closed: {:#}", err);
                            }
                        });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                        break;
                    }
                }
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Request {
    method: String,
    path: String,
    query: Option<String>,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<Request> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request completed"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line"))?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        method,
        path,
        query,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn handle_connection(
    mut stream: TcpStream,
    engine: &Arc<EngineHandle>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => serve_index(&mut stream, engine),
        ("GET", "/stream") => serve_stream(&mut stream, engine, shutdown),
        ("GET", "/snapshot") => serve_snapshot(&mut stream, engine),
        ("GET", "/stats") => {
            let stats = engine.stats();
            write_json(&mut stream, "200 OK", &serde_json::to_value(&stats)?)
        }
        ("GET", "/settings") => {
            let stats = engine.stats();
            write_json(
                &mut stream,
                "200 OK",
                &json!({ "success": true, "settings": stats.settings }),
            )
        }
        ("GET", "/mask") => serve_mask(&mut stream, engine, request.query.as_deref()),
        ("POST", "/update_mask") => {
            let value = match engine.update_mask_from_current_frame() {
                Ok(path) => json!({
                    "success": true,
                    "message": "mask updated",
                    "saved": path.display().to_string(),
                }),
                Err(err) => json!({ "success": false, "error": err.to_string() }),
            };
            write_json(&mut stream, "200 OK", &value)
        }
        ("POST", "/reset_mask") => {
            let value = match engine.reset_mask() {
                Ok(deleted) => json!({
                    "success": true,
                    "message": "mask reset",
                    "deleted": deleted.map(|p| p.display().to_string()).unwrap_or_default(),
                }),
                Err(err) => json!({ "success": false, "error": err.to_string() }),
            };
            write_json(&mut stream, "200 OK", &value)
        }
        ("POST", "/settings") => serve_settings_update(&mut stream, engine, &request.body),
        ("POST", "/restart") => {
            let engine = engine.clone();
            std::thread::spawn(move || {
                // Let the response flush before the pipeline winds down.
                std::thread::sleep(Duration::from_millis(200));
                engine.request_shutdown();
            });
            write_json(
                &mut stream,
                "202 Accepted",
                &json!({ "success": true, "message": "restart requested" }),
            )
        }
        ("OPTIONS", _) => write_response(
            &mut stream,
            "204 No Content",
            "text/plain",
            b"",
            &["Access-Control-Allow-Methods: GET, POST, OPTIONS"],
        ),
        _ => write_response(&mut stream, "404 Not Found", "text/plain", b"not found", &[]),
    }
}

fn serve_index(stream: &mut TcpStream, engine: &Arc<EngineHandle>) -> Result<()> {
    let html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>meteord - {name}</title></head>\
         <body style=\"background:#111;color:#ddd;font-family:sans-serif\">\
         <h1>{name}</h1>\
         <img src=\"/stream\" style=\"max-width:100%\" alt=\"live\">\
         <p><a href=\"/stats\" style=\"color:#7cf\">stats</a> \
         <a href=\"/snapshot\" style=\"color:#7cf\">snapshot</a></p>\
         </body></html>\n",
        name = engine.camera_name()
    );
    write_response(stream, "200 OK", "text/html; charset=utf-8", html.as_bytes(), &[])
}

fn serve_stream(
    stream: &mut TcpStream,
    engine: &Arc<EngineHandle>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
          Cache-Control: no-store\r\n\
          Connection: close\r\n\r\n",
    )?;
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = engine.display_snapshot() else {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        };
        let jpeg = encode_jpeg(&frame, STREAM_JPEG_QUALITY)?;
        stream.write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")?;
        stream.write_all(&jpeg)?;
        stream.write_all(b"\r\n")?;
        std::thread::sleep(Duration::from_millis(33));
    }
    Ok(())
}

fn serve_snapshot(stream: &mut TcpStream, engine: &Arc<EngineHandle>) -> Result<()> {
    match engine.display_snapshot() {
        Some(frame) => {
            let jpeg = encode_jpeg(&frame, SNAPSHOT_JPEG_QUALITY)?;
            write_response(
                stream,
                "200 OK",
                "image/jpeg",
                &jpeg,
                &["Cache-Control: no-store, no-cache, must-revalidate, max-age=0"],
            )
        }
        None => write_json(
            stream,
            "503 Service Unavailable",
            &json!({ "success": false, "error": "current frame not available" }),
        ),
    }
}

fn serve_mask(
    stream: &mut TcpStream,
    engine: &Arc<EngineHandle>,
    query: Option<&str>,
) -> Result<()> {
    let Some(mask) = engine.masks.exclusion() else {
        return write_response(stream, "404 Not Found", "text/plain", b"no mask", &[]);
    };
    let alpha = query
        .and_then(|q| query_param(q, "alpha"))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(120)
        .clamp(0, 255) as u8;

    let mut overlay = image::RgbaImage::new(mask.width, mask.height);
    for (pixel, &m) in overlay.pixels_mut().zip(&mask.data) {
        *pixel = if m != 0 {
            image::Rgba([255, 0, 0, alpha])
        } else {
            image::Rgba([0, 0, 0, 0])
        };
    }
    let mut png = Vec::new();
    overlay.write_with_encoder(image::codecs::png::PngEncoder::new(&mut png))?;
    write_response(
        stream,
        "200 OK",
        "image/png",
        &png,
        &["Cache-Control: no-store, no-cache, must-revalidate, max-age=0"],
    )
}

fn serve_settings_update(
    stream: &mut TcpStream,
    engine: &Arc<EngineHandle>,
    body: &[u8],
) -> Result<()> {
    let body = if body.is_empty() { b"{}" as &[u8] } else { body };
    let value = match serde_json::from_slice::<ParamsPatch>(body) {
        Ok(patch) => match engine.apply_patch(&patch) {
            Ok(_) => {
                let stats = engine.stats();
                json!({ "success": true, "settings": stats.settings })
            }
            Err(err) => json!({ "success": false, "error": err.to_string() }),
        },
        Err(err) => json!({ "success": false, "error": format!("invalid payload: {}", err) }),
    };
    write_json(stream, "200 OK", &value)
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn write_json(stream: &mut TcpStream, status: &str, value: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &body, &[])
}

fn write_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
    extra_headers: &[&str],
) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\nConnection: close\r\n",
        status,
        content_type,
        body.len()
    );
    for header in extra_headers {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
