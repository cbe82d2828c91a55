//! HTTP handlers. Pages are JSON documents carrying a `title` and either the
//! page data, a `success` message, or an `errors` list.

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::{CurrentUser, MaybeUser, SharedState};
use crate::auth::{self, expired_session_cookie, session_cookie};
use crate::error::{AppError, NOT_FOUND_PAGE};
use crate::forms::{
    ChangeEmailForm, ChangePasswordForm, SearchForm, SignInForm, SignUpForm, UploadForm,
    ValidationError, ANY,
};
use crate::labels::{ranked, Label, ModelVariant};
use crate::model::{encode_png, PreparedImage};
use crate::store::{
    artifact_reference, AccountId, AccountUpdate, HistoryFilter, HistoryId, HistoryRecord,
    NewHistoryRecord, StoreError,
};

const SIGNUP_FAILED: &str =
    "Error creating account. Either the email already exists, or something wrong with our server";
const EMAIL_CHANGE_FAILED: &str =
    "Error changing email. Either the email already exists, or something wrong with our server";
const HISTORY_MISSING: &str = "Result is not available";
const HISTORY_NOT_DELETED: &str = "Error deleting history result";

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "title": NOT_FOUND_PAGE,
            "errors": [NOT_FOUND_PAGE],
        })),
    )
}

pub async fn home(MaybeUser(user): MaybeUser) -> Json<Value> {
    Json(json!({
        "title": "Home",
        "authenticated": user.is_some(),
        "models": ModelVariant::choices(),
    }))
}

pub async fn signup_page() -> Json<Value> {
    Json(json!({
        "title": "Signup",
        "fields": ["email", "password", "confirm"],
    }))
}

pub async fn signin_page() -> Json<Value> {
    Json(json!({
        "title": "Signin",
        "fields": ["email", "password"],
    }))
}

fn logged_in(state: &SharedState, account_id: AccountId) -> Response {
    let token = state.sessions.create(account_id);
    (
        [(header::SET_COOKIE, session_cookie(&token, state.sessions.ttl()))],
        Json(json!({ "title": "Home", "account_id": account_id })),
    )
        .into_response()
}

fn logged_out() -> Response {
    (
        [(header::SET_COOKIE, expired_session_cookie())],
        Json(json!({ "title": "Home" })),
    )
        .into_response()
}

pub async fn signup(
    State(state): State<SharedState>,
    Form(form): Form<SignUpForm>,
) -> Result<Response, AppError> {
    form.validate()?;
    let password_hash = auth::hash_password(&form.password)?;

    let created = state
        .store
        .lock()
        .await
        .create_account(&form.email, &password_hash);
    let account_id = match created {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "Could not create account");
            return Err(AppError::rejected(SIGNUP_FAILED));
        }
    };

    info!(account_id, "Account created");
    Ok(logged_in(&state, account_id))
}

pub async fn signin(
    State(state): State<SharedState>,
    Form(form): Form<SignInForm>,
) -> Result<Response, AppError> {
    form.validate()?;
    let account = state.store.lock().await.find_account_by_email(&form.email)?;
    let stored_hash = account.as_ref().map(|a| a.password_hash.as_str());
    let verified = auth::verify_account_password(&form.password, stored_hash);

    match account {
        Some(account) if verified => {
            info!(account_id = account.id, "Signed in");
            Ok(logged_in(&state, account.id))
        }
        _ => Err(AppError::InvalidCredentials),
    }
}

pub async fn signout(State(state): State<SharedState>, user: CurrentUser) -> Response {
    state.sessions.remove(&user.token);
    logged_out()
}

pub async fn setting(
    State(state): State<SharedState>,
    user: CurrentUser,
) -> Result<Json<Value>, AppError> {
    let account = state
        .store
        .lock()
        .await
        .get_account(user.id)?
        .ok_or(AppError::Unauthorized)?;
    Ok(Json(json!({
        "title": "Setting",
        "email": account.email,
        "forms": ["changeEmail", "changePassword", "delete_user"],
    })))
}

pub async fn change_email(
    State(state): State<SharedState>,
    user: CurrentUser,
    Form(form): Form<ChangeEmailForm>,
) -> Result<Json<Value>, AppError> {
    form.validate()?;
    let mut store = state.store.lock().await;
    let account = store.get_account(user.id)?.ok_or(AppError::Unauthorized)?;
    if account.email != form.current_email {
        return Err(AppError::rejected(
            "Error, current email does not match with your existing email!",
        ));
    }

    let update = AccountUpdate {
        email: Some(form.new_email),
        ..Default::default()
    };
    if let Err(err) = store.update_account(user.id, update) {
        warn!(account_id = user.id, error = %err, "Could not change email");
        return Err(AppError::rejected(EMAIL_CHANGE_FAILED));
    }

    info!(account_id = user.id, "Email changed");
    Ok(Json(json!({
        "title": "Setting",
        "success": "Email changed successfully",
    })))
}

pub async fn change_password(
    State(state): State<SharedState>,
    user: CurrentUser,
    Form(form): Form<ChangePasswordForm>,
) -> Result<Json<Value>, AppError> {
    form.validate()?;
    let mut store = state.store.lock().await;
    let account = store.get_account(user.id)?.ok_or(AppError::Unauthorized)?;
    if !auth::verify_password(&form.current_password, &account.password_hash) {
        return Err(AppError::rejected(
            "Error, current password does not match with your existing password!",
        ));
    }

    let update = AccountUpdate {
        password_hash: Some(auth::hash_password(&form.new_password)?),
        ..Default::default()
    };
    if let Err(err) = store.update_account(user.id, update) {
        warn!(account_id = user.id, error = %err, "Could not change password");
        return Err(AppError::rejected("Error changing password."));
    }

    info!(account_id = user.id, "Password changed");
    Ok(Json(json!({
        "title": "Setting",
        "success": "Password changed successfully",
    })))
}

pub async fn delete_user(
    State(state): State<SharedState>,
    user: CurrentUser,
) -> Result<Response, AppError> {
    if let Err(err) = state.store.lock().await.delete_account(user.id) {
        warn!(account_id = user.id, error = %err, "Could not delete account");
        return Err(AppError::rejected("Error: fail to delete account"));
    }
    state.sessions.remove_account(user.id);
    info!(account_id = user.id, "Account deleted");
    Ok(logged_out())
}

pub async fn search_page(_user: CurrentUser) -> Json<Value> {
    let mut models = vec![ANY.to_string()];
    models.extend(ModelVariant::choices());
    let mut predictions = vec![ANY];
    predictions.extend(Label::names());
    Json(json!({
        "title": "Search",
        "models": models,
        "predictions": predictions,
        "prob_pred": 0,
    }))
}

pub async fn search(
    State(state): State<SharedState>,
    user: CurrentUser,
    Form(form): Form<SearchForm>,
) -> Result<Json<Value>, AppError> {
    let criteria = form.validate()?;
    let filter = HistoryFilter::from_criteria(user.id, &criteria);
    let results = state.store.lock().await.search_history(&filter)?;
    Ok(Json(json!({ "title": "Search", "results": results })))
}

fn parse_history_id(raw: &str) -> Result<HistoryId, AppError> {
    raw.parse().map_err(|_| history_missing())
}

fn history_missing() -> AppError {
    AppError::NotFound(HISTORY_MISSING.to_string())
}

async fn owned_history(
    state: &SharedState,
    user: &CurrentUser,
    raw_id: &str,
) -> Result<HistoryRecord, AppError> {
    let id = parse_history_id(raw_id)?;
    state
        .store
        .lock()
        .await
        .get_history(id, user.id)?
        .ok_or_else(history_missing)
}

#[derive(Debug, Serialize)]
pub struct HistoryDetail {
    pub id: HistoryId,
    pub predicted: Label,
    pub probability: String,
    pub second_most_probable: String,
    pub third_most_probable: String,
    pub model: String,
    pub predicted_at: String,
    pub image: String,
}

impl From<&HistoryRecord> for HistoryDetail {
    fn from(record: &HistoryRecord) -> Self {
        let order = ranked(&record.probabilities);
        let runner_up = |rank: usize| {
            let index = *order.get(rank)?;
            let label = Label::from_index(index)?;
            let percent = record.probabilities[index] * 100.0;
            Some(format!("{} ({:.2}%)", label, percent))
        };
        Self {
            id: record.id,
            predicted: record.pred,
            probability: format!("{:.2}%", record.highest_prob * 100.0),
            second_most_probable: runner_up(1).unwrap_or_default(),
            third_most_probable: runner_up(2).unwrap_or_default(),
            model: record.model.choice(),
            predicted_at: record.created_at.to_rfc3339(),
            image: artifact_reference(record.id),
        }
    }
}

pub async fn history(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = owned_history(&state, &user, &raw_id).await?;
    Ok(Json(json!({
        "title": "History",
        "history": HistoryDetail::from(&record),
    })))
}

pub async fn history_image(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(raw_id): Path<String>,
) -> Result<Response, AppError> {
    let record = owned_history(&state, &user, &raw_id).await?;
    let png = encode_png(record.image, record.model)
        .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub async fn delete_history(
    State(state): State<SharedState>,
    user: CurrentUser,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let id = parse_history_id(&raw_id)?;
    state
        .store
        .lock()
        .await
        .delete_history(id, user.id)
        .map_err(|err| match err {
            StoreError::NotFound => AppError::NotFound(HISTORY_NOT_DELETED.to_string()),
            other => other.into(),
        })?;
    info!(account_id = user.id, history_id = id, "History deleted");
    Ok(Json(json!({
        "title": "Search",
        "success": "History deleted",
    })))
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let malformed = |_| ValidationError::single("Malformed upload");
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                form.file_name = field.file_name().map(str::to_string);
                form.image = field.bytes().await.map_err(malformed)?.to_vec();
            }
            Some("model") => {
                form.model = field.text().await.map_err(malformed)?;
            }
            _ => {}
        }
    }

    Ok(form)
}

pub async fn predict(
    State(state): State<SharedState>,
    MaybeUser(user): MaybeUser,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let upload = read_upload(multipart).await?.validate()?;
    let prepared = PreparedImage::from_bytes(&upload.image, upload.variant)?;
    let prediction = state.predictor.predict(&prepared).await?;

    let mut history_id = None;
    let mut warning = None;
    if let Some(user) = user {
        let record = NewHistoryRecord::new(
            user.id,
            prediction.probabilities.clone(),
            prepared.rgb_bytes(),
            upload.variant,
        )?;
        match state.store.lock().await.create_history(&record) {
            Ok(id) => history_id = Some(id),
            Err(err) => {
                warn!(account_id = user.id, error = %err, "Could not store prediction");
                warning = Some("Error adding the predicted data into database.");
            }
        }
    }

    Ok(Json(json!({
        "title": "Home",
        "prediction": prediction.label,
        "probabilities": prediction.probabilities,
        "model": upload.variant,
        "history_id": history_id,
        "warning": warning,
    })))
}
