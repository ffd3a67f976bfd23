//! Request/response shapes of the wire protocol and their dispatch onto [`ApiService`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ApiError, ErrorBody};
use crate::service::ApiService;
use crate::session::Credentials;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Login {
        #[serde(default)]
        auth_code: Option<String>,
    },
    Logout,
    ListGames,
    ListInstalled,
    InstallGame {
        app_id: String,
    },
    UninstallGame {
        app_id: String,
    },
    ListProtons,
    InstallProton {
        version: String,
    },
    UninstallProton {
        version: String,
    },
    LaunchGame {
        app_id: String,
        proton_path: PathBuf,
    },
    TerminateGame {
        app_id: String,
    },
    ListLaunches,
    Job {
        job_id: String,
    },
    Jobs,
    WaitJob {
        job_id: String,
    },
    CancelJob {
        job_id: String,
    },
    GetStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Response {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Option<u64>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, err: &ApiError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(err.body()),
        }
    }
}

fn to_value<T: Serialize>(v: T) -> Result<Value, ApiError> {
    serde_json::to_value(v).map_err(|e| ApiError::Io {
        kind: std::io::ErrorKind::InvalidData,
        message: e.to_string(),
    })
}

/// Parses one request line. Malformed input becomes a validation failure response.
pub fn parse_request(line: &str) -> Result<Request, Response> {
    serde_json::from_str::<Request>(line).map_err(|e| {
        // Salvage the id so the caller can still correlate the failure.
        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_u64));
        Response::failure(id, &ApiError::validation(format!("malformed request: {e}")))
    })
}

pub async fn dispatch(svc: &ApiService, req: Request) -> Response {
    let id = req.id;
    match handle(svc, req).await {
        Ok(data) => Response::success(id, data),
        Err(e) => {
            log::debug!("request {id:?} failed: {e}");
            Response::failure(id, &e)
        }
    }
}

fn require(token: Option<&str>) -> Result<&str, ApiError> {
    token.ok_or_else(|| ApiError::auth("missing session token"))
}

async fn handle(svc: &ApiService, req: Request) -> Result<Value, ApiError> {
    let token = req.token.as_deref();

    match req.op {
        Operation::Login { auth_code } => {
            let session = svc.login(Credentials { auth_code }).await?;
            Ok(json!({ "success": true, "session": to_value(session)? }))
        }
        Operation::Logout => {
            // No token and no session is still a successful logout.
            svc.logout(token.unwrap_or_default()).await?;
            Ok(json!({ "success": true }))
        }
        Operation::ListGames => to_value(svc.list_games(require(token)?).await?),
        Operation::ListInstalled => to_value(svc.list_installed(require(token)?)?),
        Operation::InstallGame { app_id } => {
            let job = svc.install_game(require(token)?, &app_id).await?;
            Ok(json!({ "job_id": job.id, "job": to_value(job)? }))
        }
        Operation::UninstallGame { app_id } => {
            let job = svc.uninstall_game(require(token)?, &app_id).await?;
            Ok(json!({ "job_id": job.id, "job": to_value(job)? }))
        }
        Operation::ListProtons => to_value(svc.list_protons(require(token)?)?),
        Operation::InstallProton { version } => {
            let job = svc.install_proton(require(token)?, &version)?;
            Ok(json!({ "job_id": job.id, "job": to_value(job)? }))
        }
        Operation::UninstallProton { version } => {
            let job = svc.uninstall_proton(require(token)?, &version)?;
            Ok(json!({ "job_id": job.id, "job": to_value(job)? }))
        }
        Operation::LaunchGame {
            app_id,
            proton_path,
        } => {
            let handle = svc.launch_game(require(token)?, &app_id, &proton_path)?;
            Ok(json!({ "pid": handle.pid, "handle": to_value(handle)? }))
        }
        Operation::TerminateGame { app_id } => {
            let terminated = svc.terminate_game(require(token)?, &app_id).await?;
            Ok(json!({ "terminated": terminated }))
        }
        Operation::ListLaunches => to_value(svc.active_launches(require(token)?)?),
        Operation::Job { job_id } => to_value(svc.job(require(token)?, &job_id)?),
        Operation::Jobs => to_value(svc.jobs(require(token)?)?),
        Operation::WaitJob { job_id } => to_value(svc.wait_job(require(token)?, &job_id).await?),
        Operation::CancelJob { job_id } => to_value(svc.cancel_job(require(token)?, &job_id)?),
        Operation::GetStatus => Ok(Value::String(svc.get_status(require(token)?)?.to_string())),
    }
}
