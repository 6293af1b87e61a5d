use std::io::Read as _;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

/// Canned structured outputs keyed by the requested schema name.
#[derive(Debug, Clone)]
pub struct OpenAiStubConfig {
    pub api_key: String,
    pub listings: Value,
    pub page_urls: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                if request.method() != &tiny_http::Method::Post || path != "/v1/responses" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let expected_auth = format!("Bearer {}", config.api_key);
                let authorized = request.headers().iter().any(|h| {
                    h.field.equiv("Authorization") && h.value.as_str() == expected_auth
                });
                if !authorized {
                    let error = serde_json::json!({
                        "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
                    });
                    let _ = request.respond(json_response(error.to_string(), 401));
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };
                seen.lock().expect("lock request log").push(parsed.clone());

                let schema_name = parsed
                    .pointer("/text/format/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let output = match schema_name {
                    "listings_container" => config.listings.clone(),
                    "page_urls_container" => config.page_urls.clone(),
                    other => {
                        let _ = request.respond(
                            tiny_http::Response::from_string(format!(
                                "unknown schema name: {other}"
                            ))
                            .with_status_code(400),
                        );
                        continue;
                    }
                };
                let output_text = output.to_string();

                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": parsed.get("model").cloned().unwrap_or(Value::String("stub-model".to_owned())),
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ],
                    "usage": {
                        "input_tokens": config.input_tokens,
                        "output_tokens": config.output_tokens,
                        "total_tokens": config.input_tokens + config.output_tokens,
                    }
                });
                let _ = request.respond(json_response(response_body.to_string(), 200));
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Request bodies received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().expect("lock request log").clone()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn json_response(body: String, status: u16) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body)
        .with_status_code(status)
        .with_header(header)
}
