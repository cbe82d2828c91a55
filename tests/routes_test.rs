//! End-to-end tests of the HTTP surface against an in-memory store and a
//! fake model server.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use serde_json::Value;
use tower::ServiceExt;
use vegetable_service_rs::labels::VOCABULARY_SIZE;
use vegetable_service_rs::{
    router, AppState, InferenceError, Label, ModelVariant, Prediction, Predictor, PreparedImage,
    Store,
};

/// Answers `Carrot` at 90% for the 128 pixels model and `Tomato` at 50% for
/// the 31 pixels model.
struct FakePredictor;

#[async_trait]
impl Predictor for FakePredictor {
    async fn predict(&self, image: &PreparedImage) -> Result<Prediction, InferenceError> {
        let (label, top) = match image.variant() {
            ModelVariant::Px128 => (Label::Carrot, 0.9),
            ModelVariant::Px31 => (Label::Tomato, 0.5),
        };
        let rest = (1.0 - top) / (VOCABULARY_SIZE - 1) as f64;
        let mut probabilities = vec![rest; VOCABULARY_SIZE];
        probabilities[label.index()] = top;
        Prediction::from_probabilities(probabilities)
    }
}

struct FailingPredictor;

#[async_trait]
impl Predictor for FailingPredictor {
    async fn predict(&self, _image: &PreparedImage) -> Result<Prediction, InferenceError> {
        Err(InferenceError::Status(503))
    }
}

fn app_with(predictor: Arc<dyn Predictor>) -> Router {
    let store = Store::open_in_memory().unwrap();
    store.initialize().unwrap();
    router(AppState::new(store, predictor), 5 * 1024 * 1024)
}

fn app() -> Router {
    app_with(Arc::new(FakePredictor))
}

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl TestResponse {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn set_cookie(&self) -> &str {
        self.headers[header::SET_COOKIE].to_str().unwrap()
    }

    fn session(&self) -> String {
        self.set_cookie().split(';').next().unwrap().to_string()
    }

    fn errors(&self) -> Vec<String> {
        self.json()["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e.as_str().unwrap().to_string())
            .collect()
    }
}

async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = hyper::body::to_bytes(response.into_body()).await;
    let body = bytes.unwrap().to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

async fn get(app: &Router, uri: &str, cookie: Option<&str>) -> TestResponse {
    let mut request = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    send(app, request.body(Body::empty()).unwrap()).await
}

async fn status(app: &Router, uri: &str, cookie: &str) -> StatusCode {
    get(app, uri, Some(cookie)).await.status
}

async fn post_form(
    app: &Router,
    uri: &str,
    fields: &[(&str, &str)],
    cookie: Option<&str>,
) -> TestResponse {
    let body = fields
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    send(app, request.body(Body::from(body)).unwrap()).await
}

async fn sign_in(app: &Router, email: &str, password: &str) -> TestResponse {
    let fields = [("email", email), ("password", password)];
    post_form(app, "/signin", &fields, None).await
}

async fn delete_history(app: &Router, id: i64, cookie: &str) -> TestResponse {
    let uri = format!("/delete_history/{}", id);
    post_form(app, &uri, &[], Some(cookie)).await
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([x as u8, y as u8, 200])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

async fn post_image(
    app: &Router,
    image: &[u8],
    file_name: &str,
    model: &str,
    cookie: Option<&str>,
) -> TestResponse {
    let boundary = "----vegetable-boundary";
    let head = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"image\"; \
         filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    );
    let tail = format!(
        "\r\n--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\n\
         {model}\r\n--{boundary}--\r\n"
    );
    let mut body = head.into_bytes();
    body.extend_from_slice(image);
    body.extend_from_slice(tail.as_bytes());

    let content_type = format!("multipart/form-data; boundary={}", boundary);
    let mut request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, content_type);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    send(app, request.body(Body::from(body)).unwrap()).await
}

async fn sign_up(app: &Router, email: &str, password: &str) -> String {
    let response = post_form(
        app,
        "/signup",
        &[("email", email), ("password", password), ("confirm", password)],
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK, "{:?}", response.json());
    response.session()
}

async fn predict_stored(app: &Router, model: &str, cookie: &str) -> i64 {
    let img = png(64, 64);
    let response = post_image(app, &img, "veg.png", model, Some(cookie)).await;
    assert_eq!(response.status, StatusCode::OK);
    response.json()["history_id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_public_pages() {
    let app = app();
    for uri in ["/", "/index", "/home", "/signup", "/signin", "/health"] {
        assert_eq!(get(&app, uri, None).await.status, StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn test_protected_pages_require_session() {
    let app = app();
    for uri in ["/setting", "/search", "/history/1", "/signout"] {
        let response = get(&app, uri, None).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED, "{uri}");
    }
    let response = get(&app, "/setting", Some("session=forged")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let expected = ["Error 401: Unauthorised access or action"];
    assert_eq!(response.errors(), expected);

    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    for uri in ["/", "/setting", "/search"] {
        assert_eq!(status(&app, uri, &cookie).await, StatusCode::OK, "{uri}");
    }
    let home = get(&app, "/", Some(&cookie)).await;
    assert_eq!(home.json()["authenticated"], true);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = app();
    for uri in ["/ligmaballz", "/givemedistinction"] {
        let response = get(&app, uri, None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.json()["title"], "Error 404: Page not found");
    }
}

#[tokio::test]
async fn test_signup_then_signin() {
    let app = app();
    sign_up(&app, "ligma@ballz.co", "Abc12345^").await;

    let ok = sign_in(&app, "ligma@ballz.co", "Abc12345^").await;
    assert_eq!(ok.status, StatusCode::OK);
    assert!(ok.session().starts_with("session="));
    assert!(ok.set_cookie().contains("Max-Age=86400"));

    let bad = sign_in(&app, "ligma@ballz.co", "Abc12345%").await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);
    assert_eq!(bad.errors(), vec!["Invalid email or password"]);

    let unknown = sign_in(&app, "my@x.com", "Abc12345^").await;
    assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown.errors(), bad.errors());
}

#[tokio::test]
async fn test_duplicate_signup_is_generic_and_keeps_original() {
    let app = app();
    sign_up(&app, "test@test.com", "Test12345$").await;

    let response = post_form(
        &app,
        "/signup",
        &[("email", "test@test.com"), ("password", "Other123$$"), ("confirm", "Other123$$")],
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.errors()[0].starts_with("Error creating account"));
    assert!(!response.headers.contains_key(header::SET_COOKIE));

    let original = sign_in(&app, "test@test.com", "Test12345$").await;
    assert_eq!(original.status, StatusCode::OK);
}

#[tokio::test]
async fn test_signup_validation_errors() {
    let app = app();
    let response = post_form(
        &app,
        "/signup",
        &[("email", "gg.com"), ("password", "leningrad"), ("confirm", "leningrad")],
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.errors().len(), 2);
}

#[tokio::test]
async fn test_change_email() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    sign_up(&app, "taken@test.com", "Test12345$").await;

    let wrong_current = post_form(
        &app,
        "/changeEmail",
        &[("current_email", "ohno@gg.com"), ("new_email", "o@a.c")],
        Some(&cookie),
    )
    .await;
    assert_eq!(wrong_current.status, StatusCode::BAD_REQUEST);

    let taken = post_form(
        &app,
        "/changeEmail",
        &[("current_email", "test@test.com"), ("new_email", "taken@test.com")],
        Some(&cookie),
    )
    .await;
    assert_eq!(taken.status, StatusCode::BAD_REQUEST);

    let ok = post_form(
        &app,
        "/changeEmail",
        &[("current_email", "test@test.com"), ("new_email", "NOO@WHAT.cow")],
        Some(&cookie),
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json()["success"], "Email changed successfully");
    let setting = get(&app, "/setting", Some(&cookie)).await;
    assert_eq!(setting.json()["email"], "NOO@WHAT.cow");
}

#[tokio::test]
async fn test_change_password() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;

    let wrong_current = post_form(
        &app,
        "/changePassword",
        &[
            ("current_password", "Abc12345^"),
            ("new_password", "NOO@WHAT.cow69"),
            ("new_confirm", "NOO@WHAT.cow69"),
        ],
        Some(&cookie),
    )
    .await;
    assert_eq!(wrong_current.status, StatusCode::BAD_REQUEST);

    let ok = post_form(
        &app,
        "/changePassword",
        &[
            ("current_password", "Test12345$"),
            ("new_password", "NOO@WHAT.cow69"),
            ("new_confirm", "NOO@WHAT.cow69"),
        ],
        Some(&cookie),
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json()["success"], "Password changed successfully");

    let old = sign_in(&app, "test@test.com", "Test12345$").await;
    assert_eq!(old.status, StatusCode::UNAUTHORIZED);
    let new = sign_in(&app, "test@test.com", "NOO@WHAT.cow69").await;
    assert_eq!(new.status, StatusCode::OK);
}

#[tokio::test]
async fn test_anonymous_prediction_is_not_stored() {
    let app = app();
    let image = png(128, 128);
    let model = "128 pixels model";
    let response = post_image(&app, &image, "carrot.jpg", model, None).await;

    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["prediction"], "Carrot");
    let probabilities = body["probabilities"].as_array().unwrap();
    assert_eq!(probabilities.len(), VOCABULARY_SIZE);
    assert!(body["history_id"].is_null());
}

#[tokio::test]
async fn test_prediction_validation() {
    let app = app();
    let not_square = post_image(&app, &png(64, 40), "veg.png", "31", None).await;
    assert_eq!(not_square.status, StatusCode::BAD_REQUEST);
    assert!(not_square.errors()[0].contains("square"));

    let image = png(64, 64);
    let model = "64 pixels model";
    let bad_model = post_image(&app, &image, "veg.png", model, None).await;
    assert_eq!(bad_model.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_undecodable_upload_is_bad_request() {
    let app = app();
    let mut truncated = png(64, 64);
    truncated.truncate(truncated.len() / 2);

    let response = post_image(&app, &truncated, "veg.png", "31", None).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.errors(), vec!["Please upload images only!"]);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let app = app_with(Arc::new(FailingPredictor));
    let response = post_image(&app, &png(64, 64), "veg.png", "31", None).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_history_detail_and_image() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    let id = predict_stored(&app, "128 pixels model", &cookie).await;

    let detail = get(&app, &format!("/history/{}", id), Some(&cookie)).await;
    assert_eq!(detail.status, StatusCode::OK);
    let body = detail.json();
    let history = &body["history"];
    assert_eq!(history["predicted"], "Carrot");
    assert_eq!(history["probability"], "90.00%");
    assert_eq!(history["model"], "128 pixels model");
    assert_eq!(history["image"], format!("/history/{}/image", id));

    let image_uri = format!("/history/{}/image", id);
    let image = get(&app, &image_uri, Some(&cookie)).await;
    assert_eq!(image.status, StatusCode::OK);
    assert_eq!(image.headers[header::CONTENT_TYPE], "image/png");
    let decoded = image::load_from_memory(&image.body).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (128, 128));

    for uri in ["/history/9999", "/history/abc"] {
        assert_eq!(status(&app, uri, &cookie).await, StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_history_is_private_to_owner() {
    let app = app();
    let owner = sign_up(&app, "owner@test.com", "Test12345$").await;
    let intruder = sign_up(&app, "intruder@test.com", "Test12345$").await;
    let id = predict_stored(&app, "31", &owner).await;

    for uri in [format!("/history/{}", id), format!("/history/{}/image", id)] {
        let response = get(&app, &uri, Some(&intruder)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    let delete = delete_history(&app, id, &intruder).await;
    assert_eq!(delete.status, StatusCode::NOT_FOUND);
    let uri = format!("/history/{}", id);
    assert_eq!(status(&app, &uri, &owner).await, StatusCode::OK);
}

#[tokio::test]
async fn test_delete_history() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    let id = predict_stored(&app, "31 pixels model", &cookie).await;

    let deleted = delete_history(&app, id, &cookie).await;
    assert_eq!(deleted.status, StatusCode::OK);
    let uri = format!("/history/{}", id);
    assert_eq!(status(&app, &uri, &cookie).await, StatusCode::NOT_FOUND);

    let again = delete_history(&app, id, &cookie).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_filters_and_isolates_owners() {
    let app = app();
    let first = sign_up(&app, "one@test.com", "Test12345$").await;
    let second = sign_up(&app, "two@test.com", "Test12345$").await;
    let carrot = predict_stored(&app, "128 pixels model", &first).await;
    let tomato = predict_stored(&app, "31 pixels model", &first).await;
    predict_stored(&app, "128 pixels model", &second).await;

    let search = |model: &'static str, prediction: &'static str, prob: &'static str| {
        let app = app.clone();
        let first = first.clone();
        async move {
            let response = post_form(
                &app,
                "/search",
                &[("model", model), ("prediction", prediction), ("prob_pred", prob)],
                Some(&first),
            )
            .await;
            assert_eq!(response.status, StatusCode::OK);
            response.json()["results"]
                .as_array()
                .unwrap()
                .iter()
                .map(|row| row["record_id"].as_i64().unwrap())
                .collect::<Vec<_>>()
        }
    };

    assert_eq!(search("Any", "Any", "0").await, vec![carrot, tomato]);
    assert_eq!(search("128 pixels model", "Any", "0").await, vec![carrot]);
    assert_eq!(search("Any", "Tomato", "0").await, vec![tomato]);
    assert_eq!(search("Any", "Any", "60").await, vec![carrot]);
    let none = search("31 pixels model", "Carrot", "0").await;
    assert!(none.is_empty());

    let rows = post_form(
        &app,
        "/search",
        &[("model", "Any"), ("prediction", "Carrot"), ("prob_pred", "0")],
        Some(&first),
    )
    .await
    .json();
    let row = &rows["results"][0];
    assert_eq!(row["artifact"], format!("/history/{}/image", carrot));
    assert_eq!(row["model"], "128");
    assert_eq!(row["label"], "Carrot");
    assert_eq!(row["probability_percent"], 90.0);
}

#[tokio::test]
async fn test_search_rejects_invalid_criteria() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    let response = post_form(
        &app,
        "/search",
        &[("model", "Any"), ("prediction", "Carrot\" OR 1=1 --"), ("prob_pred", "150")],
        Some(&cookie),
    )
    .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.errors().len(), 2);
}

#[tokio::test]
async fn test_delete_user_cascades_and_ends_sessions() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;
    let id = predict_stored(&app, "128", &cookie).await;

    let response = post_form(&app, "/delete_user", &[], Some(&cookie)).await;
    assert_eq!(response.status, StatusCode::OK);

    let setting = status(&app, "/setting", &cookie).await;
    assert_eq!(setting, StatusCode::UNAUTHORIZED);
    let signin = sign_in(&app, "test@test.com", "Test12345$").await;
    assert_eq!(signin.status, StatusCode::UNAUTHORIZED);

    let again = sign_up(&app, "test@test.com", "Test12345$").await;
    let uri = format!("/history/{}", id);
    assert_eq!(status(&app, &uri, &again).await, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_signout_ends_session() {
    let app = app();
    let cookie = sign_up(&app, "test@test.com", "Test12345$").await;

    let response = get(&app, "/signout", Some(&cookie)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.set_cookie().contains("Max-Age=0"));
    let search = status(&app, "/search", &cookie).await;
    assert_eq!(search, StatusCode::UNAUTHORIZED);
}
