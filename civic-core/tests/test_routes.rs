mod support;
use crate::support::{
    create_week_three, setup_test_environment, setup_test_environment_with, test_bytes, KB,
};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use civic_core::routes::create_router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "----civic-test-boundary";

/// Hand-built multipart/form-data body.
#[derive(Default)]
struct Form {
    body: Vec<u8>,
}

impl Form {
    fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn request(mut self, method: &str, uri: &str) -> Request<Body> {
        self.body
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header("x-actor", "route-tests")
            .body(Body::from(self.body))
            .unwrap()
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_range(uri: &str, range: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::RANGE, range)
        .body(Body::empty())
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> &'a str {
    response.headers().get(name).unwrap().to_str().unwrap()
}

#[tokio::test]
async fn create_week_over_multipart_then_range_the_report() {
    let (state, _tmp) = setup_test_environment().await;
    let app = create_router(state.clone());
    let report = test_bytes(1024 * KB, 7);

    let form = Form::default()
        .text("weekNumber", "3")
        .text("summary", "Park cleanup")
        .file("photos", "a.jpg", "image/jpeg", &test_bytes(200 * KB, 1))
        .file("photos", "b.jpg", "image/jpeg", &test_bytes(50 * KB, 2))
        .file("reportPdf", "report.pdf", "application/pdf", &report);
    let response = send(&app, form.request("POST", "/api/weeks")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let week = body_json(response).await;
    assert_eq!(week["weekNumber"], 3);
    assert_eq!(week["photoFileIds"].as_array().unwrap().len(), 2);
    let report_id = week["reportFileId"].as_str().unwrap().to_string();

    let response = send(&app, get("/api/weeks/3")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["reportFileId"], report_id.as_str());

    let response = send(
        &app,
        get_range(&format!("/api/files/{}", report_id), "bytes=0-99"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        "bytes 0-99/1048576"
    );
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
    assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/pdf");
    assert_eq!(body_bytes(response).await, report[..100].to_vec());

    let response = send(
        &app,
        get_range(&format!("/api/files/{}", report_id), "bytes=5000000-6000000"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        "bytes */1048576"
    );
}

#[tokio::test]
async fn duplicate_week_upload_is_a_conflict() {
    let (state, _tmp) = setup_test_environment().await;
    create_week_three(&state).await;
    let app = create_router(state.clone());

    let form = Form::default()
        .text("weekNumber", "3")
        .text("summary", "Again")
        .file("photos", "c.jpg", "image/jpeg", &test_bytes(10 * KB, 3));
    let response = send(&app, form.request("POST", "/api/weeks")).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("already exists"));
    assert_eq!(state.linker.files().catalog().count().await.unwrap(), 3);
}

#[tokio::test]
async fn files_before_week_number_are_rejected() {
    let (state, _tmp) = setup_test_environment().await;
    let app = create_router(state.clone());

    let form = Form::default()
        .file("photos", "a.jpg", "image/jpeg", &test_bytes(KB, 1))
        .text("weekNumber", "4")
        .text("summary", "Out of order");
    let response = send(&app, form.request("POST", "/api/weeks")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.linker.files().catalog().count().await.unwrap(), 0);
}

#[tokio::test]
async fn wrong_file_type_rolls_back_the_draft() {
    let (state, _tmp) = setup_test_environment().await;
    let app = create_router(state.clone());

    let form = Form::default()
        .text("weekNumber", "4")
        .text("summary", "Mixed")
        .file("photos", "a.jpg", "image/jpeg", &test_bytes(KB, 1))
        .file("photos", "notes.txt", "text/plain", b"not an image");
    let response = send(&app, form.request("POST", "/api/weeks")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.linker.files().catalog().count().await.unwrap(), 0);
    let response = send(&app, get("/api/weeks/4")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_file_and_conditional_requests() {
    let (state, _tmp) = setup_test_environment().await;
    let week = create_week_three(&state).await;
    let app = create_router(state.clone());
    let photo = &week.photo_file_ids[1];
    let uri = format!("/api/weeks/3/files/{}", photo);

    let response = send(&app, get(&uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, header::CONTENT_LENGTH),
        (50 * KB).to_string()
    );
    assert!(header_str(&response, header::CONTENT_DISPOSITION).starts_with("inline"));
    assert!(header_str(&response, header::CACHE_CONTROL).contains("immutable"));
    let etag = header_str(&response, header::ETAG).to_string();
    assert_eq!(body_bytes(response).await, test_bytes(50 * KB, 2).to_vec());

    let cached = Request::builder()
        .uri(&uri)
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .unwrap();
    let response = send(&app, cached).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(response).await.is_empty());

    let stale = Request::builder()
        .uri(&uri)
        .header(header::RANGE, "bytes=0-9")
        .header(header::IF_RANGE, "\"something-else\"")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, stale).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, get_range(&uri, "bytes=-10")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&response, header::CONTENT_RANGE),
        format!("bytes {}-{}/{}", 50 * KB - 10, 50 * KB - 1, 50 * KB)
    );

    let response = send(&app, get(&format!("{}?download=true", uri))).await;
    assert!(header_str(&response, header::CONTENT_DISPOSITION).starts_with("attachment"));
}

#[tokio::test]
async fn week_file_route_checks_membership() {
    let (state, _tmp) = setup_test_environment().await;
    let week = create_week_three(&state).await;
    let app = create_router(state.clone());

    let uri = format!("/api/weeks/4/files/{}", week.photo_file_ids[0]);
    assert_eq!(send(&app, get(&uri)).await.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get("/api/files/not-a-uuid")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_with_missing_chunks_is_a_server_error() {
    let (state, _tmp) = setup_test_environment().await;
    let week = create_week_three(&state).await;
    let photo = week.photo_file_ids[0].clone();
    state.linker.files().chunks().delete_all(&photo).await.unwrap();
    let app = create_router(state.clone());

    let response = send(&app, get(&format!("/api/files/{}", photo))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["error"], "Internal server error");
}

#[tokio::test]
async fn photo_and_report_routes() {
    let (state, _tmp) = setup_test_environment().await;
    let week = create_week_three(&state).await;
    let app = create_router(state.clone());

    let form = Form::default().file("photos", "c.png", "image/png", &test_bytes(KB, 4));
    let response = send(&app, form.request("POST", "/api/weeks/3/photos")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let change = body_json(response).await;
    assert_eq!(change["week"]["photoFileIds"].as_array().unwrap().len(), 3);

    let uri = format!("/api/weeks/3/photos/{}", week.photo_file_ids[0]);
    let response = send(&app, delete(&uri)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["week"]["photoFileIds"].as_array().unwrap().len(), 2);

    let form = Form::default().file("reportPdf", "v2.pdf", "application/pdf", &test_bytes(KB, 5));
    let response = send(&app, form.request("PUT", "/api/weeks/3/report")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let change = body_json(response).await;
    assert_ne!(
        change["week"]["reportFileId"].as_str().unwrap(),
        week.report_file_id.as_ref().unwrap().as_str()
    );

    let response = send(&app, delete("/api/weeks/3/report")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["week"]["reportFileId"].is_null());

    let response = send(&app, delete("/api/weeks/3/report")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_week_and_audit_routes() {
    let (state, _tmp) = setup_test_environment().await;
    let week = create_week_three(&state).await;
    state
        .linker
        .files()
        .catalog()
        .remove(&week.photo_file_ids[0])
        .await
        .unwrap();
    let app = create_router(state.clone());

    let response = send(&app, get("/api/audit")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let audit = body_json(response).await;
    assert_eq!(audit["danglingReferences"][0]["weekNumber"], 3);

    let response = send(&app, delete(&format!("/api/weeks/id/{}", week.id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let deletion = body_json(response).await;
    assert_eq!(deletion["removed"].as_array().unwrap().len(), 2);
    assert_eq!(deletion["failed"].as_array().unwrap().len(), 1);

    let response = send(&app, get("/api/audit?verifyChecksums=true")).await;
    let audit = body_json(response).await;
    assert!(audit["danglingReferences"].as_array().unwrap().is_empty());
    assert_eq!(audit["totalFiles"], 0);

    let repair = Request::builder()
        .method("POST")
        .uri("/api/audit/repair")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"deleteOrphans":true}"#))
        .unwrap();
    let response = send(&app, repair).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["repairs"]["deletedOrphans"], 0);
}

#[tokio::test]
async fn health_and_listing() {
    let (state, _tmp) = setup_test_environment().await;
    create_week_three(&state).await;
    let app = create_router(state.clone());

    let response = send(&app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = send(&app, get("/api/weeks?order=desc")).await;
    let weeks = body_json(response).await;
    assert_eq!(weeks.as_array().unwrap().len(), 1);

    let response = send(&app, get("/api/weeks/9")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_body_is_payload_too_large() {
    let (state, _tmp) = setup_test_environment_with(|config| config.max_file_bytes = KB as u64).await;
    let app = create_router(state.clone());
    let long_summary = "x".repeat(40 * KB);

    let form = Form::default()
        .text("weekNumber", "3")
        .text("summary", &long_summary)
        .file("photos", "a.jpg", "image/jpeg", &test_bytes(512, 1));
    let response = send(&app, form.request("POST", "/api/weeks")).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(state.linker.files().catalog().count().await.unwrap(), 0);
}

#[tokio::test]
async fn body_limit_reached_inside_a_file_part_is_payload_too_large() {
    let (state, _tmp) =
        setup_test_environment_with(|config| config.max_file_bytes = 2 * KB as u64).await;
    let app = create_router(state.clone());

    let mut form = Form::default()
        .text("weekNumber", "3")
        .text("summary", "Many photos");
    for i in 0..40u8 {
        form = form.file("photos", &format!("{i}.jpg"), "image/jpeg", &test_bytes(2 * KB - 100, i));
    }
    let response = send(&app, form.request("POST", "/api/weeks")).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(state.linker.files().catalog().count().await.unwrap(), 0);
    assert!(state.linker.files().chunks().chunk_sets().await.unwrap().is_empty());
}
