//! Axum + Askama pages and JSON API for What to Watch.

pub mod api;
mod csrf;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};
use wtw_core::{is_allowed_image, validate_fields, NewOpinion, Opinion};
use wtw_dropbox::{DropboxClient, DropboxConfig, UploadFile};
use wtw_storage::{OpinionStore, StorageError};

pub use csrf::{CsrfGuard, InvalidSecret, DEFAULT_CSRF_MAX_AGE};

pub const CRATE_NAME: &str = "wtw-web";

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

pub const DUPLICATE_FLASH: &str = "This opinion has already been submitted!";
pub const CSRF_FLASH: &str = "The form expired, please submit it again";
const EMPTY_STORE_PAGE_MESSAGE: &str = "There are no opinions yet.";
const IMAGE_EXTENSION_MESSAGE: &str = "Choose files with extension .jpg, .jpeg, .png, .gif or .bmp";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is required")]
    Missing(&'static str),
    #[error("environment variable {name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_uri: String,
    pub secret_key: String,
    pub dropbox_token: String,
    pub port: u16,
    pub upload_concurrency: usize,
    pub http_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub csrf_max_age_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        Ok(Self {
            database_uri: required("DATABASE_URI")?,
            secret_key: required("SECRET_KEY")?,
            dropbox_token: required("DROPBOX_TOKEN")?,
            port: optional(&lookup, "WTW_WEB_PORT", 5000)?,
            upload_concurrency: optional(&lookup, "WTW_UPLOAD_CONCURRENCY", 4)?,
            http_timeout_secs: optional(&lookup, "WTW_HTTP_TIMEOUT_SECS", 30)?,
            max_upload_bytes: optional(&lookup, "WTW_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            csrf_max_age_secs: optional(
                &lookup,
                "WTW_CSRF_MAX_AGE_SECS",
                DEFAULT_CSRF_MAX_AGE.as_secs(),
            )?,
        })
    }

    pub fn dropbox(&self) -> DropboxConfig {
        DropboxConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            concurrency: self.upload_concurrency,
            ..DropboxConfig::new(self.dropbox_token.clone())
        }
    }
}

fn optional<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Everything a handler needs, built once and shared through the router.
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: OpinionStore,
    pub dropbox: DropboxClient,
    pub csrf: CsrfGuard,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(store: OpinionStore, dropbox: DropboxClient, csrf: CsrfGuard) -> Self {
        Self {
            store,
            dropbox,
            csrf,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    /// Connect and migrate the store, then build the upload client.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let store = OpinionStore::connect(&config.database_uri).await?;
        store.migrate().await?;
        let dropbox = DropboxClient::new(config.dropbox())?;
        let csrf = CsrfGuard::new(&config.secret_key)?
            .with_max_age(Duration::from_secs(config.csrf_max_age_secs));
        let mut state = Self::new(store, dropbox, csrf);
        state.max_upload_bytes = config.max_upload_bytes;
        Ok(state)
    }
}

/// Opinion prepared for display.
#[derive(Debug, Clone)]
struct OpinionView {
    title: String,
    text: String,
    source: String,
    added_by: String,
    timestamp: String,
    images: Vec<String>,
}

impl From<Opinion> for OpinionView {
    fn from(opinion: Opinion) -> Self {
        Self {
            title: opinion.title,
            text: opinion.text,
            source: opinion.source.unwrap_or_default(),
            added_by: opinion.added_by.unwrap_or_default(),
            timestamp: opinion.timestamp.format("%Y-%m-%d %H:%M UTC").to_string(),
            images: opinion.images,
        }
    }
}

#[derive(Template)]
#[template(path = "opinion.html")]
struct OpinionTemplate {
    opinion: OpinionView,
}

#[derive(Debug, Default)]
struct FormErrors {
    title: Vec<String>,
    text: Vec<String>,
    source: Vec<String>,
    added_by: Vec<String>,
    images: Vec<String>,
}

impl FormErrors {
    fn push(&mut self, field: &str, message: String) {
        match field {
            "title" => self.title.push(message),
            "text" => self.text.push(message),
            "source" => self.source.push(message),
            "added_by" => self.added_by.push(message),
            _ => self.images.push(message),
        }
    }

    fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.text.is_empty()
            && self.source.is_empty()
            && self.added_by.is_empty()
            && self.images.is_empty()
    }
}

#[derive(Template)]
#[template(path = "add_opinion.html")]
struct AddOpinionTemplate {
    csrf_token: String,
    title: String,
    text: String,
    source: String,
    added_by: String,
    errors: FormErrors,
    flash: String,
}

#[derive(Template)]
#[template(path = "404.html")]
struct NotFoundTemplate;

#[derive(Template)]
#[template(path = "500.html")]
struct ServerErrorTemplate {
    message: String,
}

/// Submitted `/add` form. Text fields are kept verbatim for re-rendering.
#[derive(Debug, Default)]
struct OpinionForm {
    csrf_token: String,
    title: String,
    text: String,
    source: String,
    added_by: String,
    images: Vec<UploadFile>,
}

impl OpinionForm {
    async fn from_multipart(mut multipart: Multipart) -> Result<Self, MultipartError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "images" {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await?;
                // An untouched file input still sends one empty part.
                if !filename.is_empty() {
                    form.images.push(UploadFile::new(filename, bytes.to_vec()));
                }
                continue;
            }
            let value = field.text().await?;
            match name.as_str() {
                "csrf_token" => form.csrf_token = value,
                "title" => form.title = value,
                "text" => form.text = value,
                "source" => form.source = value,
                "added_by" => form.added_by = value,
                _ => {}
            }
        }
        Ok(form)
    }

    fn source(&self) -> Option<String> {
        non_blank(&self.source)
    }

    fn added_by(&self) -> Option<String> {
        non_blank(&self.added_by)
    }

    fn validate(&self) -> FormErrors {
        let mut errors = FormErrors::default();
        if let Err(err) = validate_fields(
            &self.title,
            &self.text,
            self.source().as_deref(),
            self.added_by().as_deref(),
        ) {
            for field_error in err.field_errors() {
                errors.push(field_error.field, field_error.message.clone());
            }
        }
        if self.images.iter().any(|image| !is_allowed_image(&image.filename)) {
            errors.push("images", IMAGE_EXTENSION_MESSAGE.to_string());
        }
        errors
    }

    fn render(self, csrf_token: String, errors: FormErrors, flash: &str) -> AddOpinionTemplate {
        AddOpinionTemplate {
            csrf_token,
            title: self.title,
            text: self.text,
            source: self.source,
            added_by: self.added_by,
            errors,
            flash: flash.to_string(),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/", get(index_handler))
        .route("/add", get(add_form_handler).post(add_submit_handler))
        .route("/opinions/{id}", get(opinion_detail_handler))
        .merge(api::routes())
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "what-to-watch listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppConfig::from_env()?).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.random().await {
        Ok(Some(opinion)) => render_html(OpinionTemplate {
            opinion: opinion.into(),
        }),
        Ok(None) => server_error_page(EMPTY_STORE_PAGE_MESSAGE),
        Err(err) => server_error(err.into()),
    }
}

async fn opinion_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return not_found_page();
    };
    match state.store.get(id).await {
        Ok(Some(opinion)) => render_html(OpinionTemplate {
            opinion: opinion.into(),
        }),
        Ok(None) => not_found_page(),
        Err(err) => server_error(err.into()),
    }
}

async fn add_form_handler(State(state): State<Arc<AppState>>) -> Response {
    render_html(OpinionForm::default().render(state.csrf.issue(), FormErrors::default(), ""))
}

async fn add_submit_handler(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let mut form = match OpinionForm::from_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => {
            warn!(error = %err, "unreadable opinion form");
            return (err.status(), Html(err.body_text())).into_response();
        }
    };

    if !state.csrf.verify(&form.csrf_token) {
        warn!("opinion form rejected: bad csrf token");
        let tpl = form.render(state.csrf.issue(), FormErrors::default(), CSRF_FLASH);
        return with_status(StatusCode::BAD_REQUEST, render_html(tpl));
    }

    let errors = form.validate();
    if !errors.is_empty() {
        return render_html(form.render(state.csrf.issue(), errors, ""));
    }

    match state.store.text_exists(&form.text, None).await {
        Ok(false) => {}
        Ok(true) => return duplicate_form(&state, form),
        Err(err) => return server_error(err.into()),
    }

    let new = NewOpinion {
        title: form.title.clone(),
        text: form.text.clone(),
        source: form.source(),
        added_by: form.added_by(),
        images: Vec::new(),
    };
    let files = std::mem::take(&mut form.images);
    let images = match state.dropbox.upload_all(files).await {
        Ok(urls) => urls,
        Err(err) => return server_error(err.into()),
    };
    let new = NewOpinion { images, ..new };

    match state.store.insert(&new).await {
        Ok(opinion) => Redirect::to(&format!("/opinions/{}", opinion.id)).into_response(),
        Err(StorageError::Duplicate(_)) => duplicate_form(&state, form),
        Err(err) => server_error(err.into()),
    }
}

fn duplicate_form(state: &AppState, form: OpinionForm) -> Response {
    warn!("opinion form rejected: duplicate text");
    render_html(form.render(state.csrf.issue(), FormErrors::default(), DUPLICATE_FLASH))
}

async fn not_found_handler() -> Response {
    not_found_page()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn with_status(status: StatusCode, mut resp: Response) -> Response {
    if resp.status() == StatusCode::OK {
        *resp.status_mut() = status;
    }
    resp
}

fn not_found_page() -> Response {
    with_status(StatusCode::NOT_FOUND, render_html(NotFoundTemplate))
}

fn server_error_page(message: &str) -> Response {
    let tpl = ServerErrorTemplate {
        message: message.to_string(),
    };
    match tpl.render() {
        Ok(html) => (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {message}")),
        )
            .into_response(),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = ?err, "page handler failed");
    server_error_page("Something went wrong. Please try again later.")
}
