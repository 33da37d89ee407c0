//! HTTP handlers. Each handler sequences calls into the services held by
//! `AppState` and converts their errors into client-facing responses.

pub mod auth_handlers;
pub mod health_handlers;
pub mod upload_handlers;

#[cfg(test)]
pub(crate) mod tests {
    use crate::{routes::routes::routes, state::tests::test_state};
    use axum::{
        Router,
        body::Body,
        http::{Request, Response, header},
    };
    use std::{path::Path, time::Duration};

    const BOUNDARY: &str = "----image-solver-test-boundary";

    /// Router over fresh test state with a trivial worker.
    pub(crate) async fn test_app(upload_dir: &Path) -> Router {
        routes().with_state(test_state(upload_dir, "echo ok", Duration::from_secs(30)).await)
    }

    pub(crate) fn json_post(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Build a multipart request from `(field name, file name, bytes)` parts.
    pub(crate) fn multipart_post(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, bytes) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                }
                None => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                    );
                }
            }
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    pub(crate) async fn read_json(res: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
