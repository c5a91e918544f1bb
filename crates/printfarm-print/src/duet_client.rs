// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Duet (RepRapFirmware) client over the standalone `rr_` HTTP API.
//
// Endpoints used:
//
// | Call            | Request                                   |
// |-----------------|-------------------------------------------|
// | open session    | `GET rr_connect?password=&time=`          |
// | object model    | `GET rr_model?key=<key>&flags=d99vn`      |
// | run G-code      | `GET rr_gcode?gcode=`                     |
// | fetch reply     | `GET rr_reply`                            |
// | upload file     | `POST rr_upload?name=&time=` (raw body)   |
// | delete file     | `GET rr_delete?name=`                     |
// | close session   | `GET rr_disconnect`                       |
//
// The board has no push channel, so each session runs a poll task that
// diffs successive object model snapshots into `FieldChange`s.  When a
// poll fails the task reports `Disconnected` once, then keeps polling and
// reopening the session until the board answers again.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use printfarm_core::FarmConfig;
use printfarm_core::error::{FarmError, Result};
use printfarm_core::types::MachineStatus;

use crate::remote::{Connection, FieldChange, RemoteConnector, RemoteModel, RemoteSession};

/// Object model query flags: full depth, verbose, null values included.
const MODEL_FLAGS: &str = "d99vn";

/// Upper bound for every request except uploads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls without a reply after which an idle board is assumed to have
/// nothing to say.
const QUIET_POLLS: u32 = 2;

/// Header carrying the session key on RepRapFirmware 3.5 and later.
const SESSION_KEY_HEADER: &str = "X-Session-Key";

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens `rr_` sessions to Duet boards.
pub struct DuetConnector {
    client: reqwest::Client,
    password: String,
    poll_interval: Duration,
    reply_timeout: Duration,
}

impl DuetConnector {
    pub fn new(config: &FarmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| FarmError::Http(e.to_string()))?;
        Ok(Self {
            client,
            password: config.password.clone(),
            poll_interval: config.poll_interval(),
            reply_timeout: config.reply_timeout(),
        })
    }
}

#[async_trait]
impl RemoteConnector for DuetConnector {
    #[instrument(skip(self))]
    async fn connect(&self, hostname: &str) -> Result<Connection> {
        let http = DuetHttp {
            client: self.client.clone(),
            base_url: base_url(hostname),
            password: self.password.clone(),
            poll_interval: self.poll_interval,
            reply_timeout: self.reply_timeout,
            session_key: Arc::new(Mutex::new(None)),
        };

        let connect_error = |e: FarmError| FarmError::Connect {
            hostname: hostname.to_string(),
            detail: e.to_string(),
        };
        http.open().await.map_err(connect_error)?;
        let model = http.fetch_model().await.map_err(connect_error)?;
        info!(status = %model.status, name = %model.network_name, "connected to board");

        let (tx, changes) = mpsc::unbounded_channel();
        let poller = CancellationToken::new();
        let task = tokio::spawn(poll(http.clone(), model.clone(), tx, poller.clone()));

        Ok(Connection {
            session: Arc::new(DuetSession {
                http,
                poller,
                task: Mutex::new(Some(task)),
            }),
            model,
            changes,
        })
    }
}

fn base_url(hostname: &str) -> String {
    let hostname = hostname.trim_end_matches('/');
    if hostname.contains("://") {
        hostname.to_string()
    } else {
        format!("http://{hostname}")
    }
}

// ---------------------------------------------------------------------------
// HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct DuetHttp {
    client: reqwest::Client,
    base_url: String,
    password: String,
    poll_interval: Duration,
    reply_timeout: Duration,
    session_key: Arc<Mutex<Option<u64>>>,
}

/// `{"err": n, ...}` returned by most `rr_` calls.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ErrReply {
    err: u32,
    session_key: Option<u64>,
}

/// Envelope of an `rr_model` response.
#[derive(Debug, Deserialize)]
struct ModelReply<T> {
    result: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StateModel {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JobModel {
    duration: Option<f64>,
    file_position: Option<u64>,
    file: Option<FileModel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileModel {
    file_name: Option<String>,
    size: u64,
    print_time: Option<f64>,
    simulated_time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NetworkModel {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SeqsModel {
    reply: u64,
}

fn transport_error(e: reqwest::Error) -> FarmError {
    if e.is_decode() {
        FarmError::Http(e.to_string())
    } else {
        FarmError::Offline(e.to_string())
    }
}

fn timestamp(time: DateTime<Local>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Parse an object model status string.  Unknown values count as busy.
fn parse_status(status: &str) -> MachineStatus {
    serde_json::from_value(serde_json::Value::String(status.to_string()))
        .unwrap_or(MachineStatus::Busy)
}

impl DuetHttp {
    fn url(&self, path_and_query: &str) -> String {
        format!("{}/{path_and_query}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path_and_query: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path_and_query));
        let key = *self.session_key.lock().unwrap_or_else(PoisonError::into_inner);
        match key {
            Some(key) => builder.header(SESSION_KEY_HEADER, key.to_string()),
            None => builder,
        }
    }

    async fn get(&self, path_and_query: &str) -> Result<reqwest::Response> {
        self.request(reqwest::Method::GET, path_and_query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        self.get(path_and_query)
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    /// `rr_connect`.  Stores the session key when the board hands one out.
    async fn open(&self) -> Result<()> {
        let reply: ErrReply = self
            .get_json(&format!(
                "rr_connect?password={}&time={}",
                urlencoding::encode(&self.password),
                urlencoding::encode(&timestamp(Local::now())),
            ))
            .await?;
        match reply.err {
            0 => {
                *self
                    .session_key
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = reply.session_key;
                Ok(())
            }
            1 => Err(FarmError::Http("invalid board password".into())),
            2 => Err(FarmError::Http("no more HTTP sessions available".into())),
            code => Err(FarmError::Http(format!("rr_connect failed with code {code}"))),
        }
    }

    async fn query<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let reply: ModelReply<T> = self
            .get_json(&format!("rr_model?key={key}&flags={MODEL_FLAGS}"))
            .await?;
        Ok(reply.result.unwrap_or_default())
    }

    async fn fetch_model(&self) -> Result<RemoteModel> {
        let state: StateModel = self.query("state").await?;
        let job: JobModel = self.query("job").await?;
        let network: NetworkModel = self.query("network").await?;

        let file = job.file.unwrap_or_default();
        Ok(RemoteModel {
            network_name: network.name,
            status: parse_status(&state.status),
            file_name: file.file_name,
            file_size: file.size,
            print_time: file.print_time.map(|t| t as i64),
            simulated_time: file.simulated_time.map(|t| t as i64),
            duration: job.duration.map(|d| d as i64),
            file_position: job.file_position,
        })
    }

    async fn reply_seq(&self) -> Result<u64> {
        let seqs: SeqsModel = self.query("seqs").await?;
        Ok(seqs.reply)
    }

    async fn status(&self) -> Result<MachineStatus> {
        let state: StateModel = self.query("state").await?;
        Ok(parse_status(&state.status))
    }

    /// Run `code` and collect its reply.
    ///
    /// The reply is fetched once the board's reply sequence number moves.
    /// A board that stays out of `busy` for a couple of polls without a new
    /// reply is taken to have none.
    async fn send_code(&self, code: &str) -> Result<String> {
        let before = self.reply_seq().await?;
        let _: serde_json::Value = self
            .get_json(&format!("rr_gcode?gcode={}", urlencoding::encode(code)))
            .await?;

        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        let mut quiet = 0;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            if self.reply_seq().await? != before {
                let reply = self.get("rr_reply").await?.text().await.map_err(transport_error)?;
                return Ok(reply);
            }
            if self.status().await? == MachineStatus::Busy {
                quiet = 0;
            } else {
                quiet += 1;
                if quiet >= QUIET_POLLS {
                    return Ok(String::new());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FarmError::Http(format!("timed out waiting for reply to {code}")));
            }
        }
    }

    async fn upload(&self, path: &str, contents: Vec<u8>, modified: DateTime<Local>) -> Result<()> {
        let upload_error = |detail: String| FarmError::Upload {
            path: path.to_string(),
            detail,
        };
        let reply: ErrReply = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "rr_upload?name={}&time={}",
                    urlencoding::encode(path),
                    urlencoding::encode(&timestamp(modified)),
                ),
            )
            .body(contents)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error)?
            .json()
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        if reply.err != 0 {
            return Err(upload_error(format!("board returned code {}", reply.err)));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let reply: ErrReply = self
            .get_json(&format!("rr_delete?name={}", urlencoding::encode(path)))
            .await?;
        if reply.err != 0 {
            return Err(FarmError::Http(format!(
                "rr_delete of {path} failed with code {}",
                reply.err
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.get("rr_disconnect").await {
            debug!(error = %e, "rr_disconnect failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Changes turning `old` into `new`.  File details come before position and
/// duration so that consumers see the new file size first.
fn diff(old: &RemoteModel, new: &RemoteModel) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if old.network_name != new.network_name {
        changes.push(FieldChange::NetworkName(new.network_name.clone()));
    }
    if old.file_name != new.file_name
        || old.file_size != new.file_size
        || old.print_time != new.print_time
        || old.simulated_time != new.simulated_time
    {
        changes.push(FieldChange::File {
            name: new.file_name.clone(),
            size: new.file_size,
            print_time: new.print_time,
            simulated_time: new.simulated_time,
        });
    }
    if old.file_position != new.file_position {
        changes.push(FieldChange::FilePosition(new.file_position));
    }
    if old.duration != new.duration {
        changes.push(FieldChange::Duration(new.duration));
    }
    if old.status != new.status {
        changes.push(FieldChange::Status(new.status));
    }
    changes
}

async fn poll(
    http: DuetHttp,
    mut model: RemoteModel,
    changes: mpsc::UnboundedSender<FieldChange>,
    cancel: CancellationToken,
) {
    let mut reachable = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(http.poll_interval) => {}
            _ = cancel.cancelled() => return,
        }

        let next = if reachable {
            http.fetch_model().await
        } else {
            match http.open().await {
                Ok(()) => http.fetch_model().await,
                Err(e) => Err(e),
            }
        };

        match next {
            Ok(next) => {
                if !reachable {
                    info!(url = %http.base_url, "board is reachable again");
                    reachable = true;
                }
                for change in diff(&model, &next) {
                    if changes.send(change).is_err() {
                        return;
                    }
                }
                model = next;
            }
            Err(e) if reachable => {
                warn!(url = %http.base_url, error = %e, "lost connection to board");
                reachable = false;
                model.status = MachineStatus::Disconnected;
                if changes
                    .send(FieldChange::Status(MachineStatus::Disconnected))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => debug!(url = %http.base_url, error = %e, "board still unreachable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct DuetSession {
    http: DuetHttp,
    poller: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RemoteSession for DuetSession {
    async fn send_code(&self, code: &str) -> Result<String> {
        debug!(url = %self.http.base_url, %code, "sending code");
        self.http.send_code(code).await
    }

    async fn upload(&self, path: &str, contents: Vec<u8>, modified: DateTime<Local>) -> Result<()> {
        debug!(url = %self.http.base_url, %path, bytes = contents.len(), "uploading file");
        self.http.upload(path, contents, modified).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.http.delete(path).await
    }

    async fn close(&self) {
        self.poller.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.http.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Board {
        status: String,
        reply_seq: u64,
        pending_reply: String,
        codes: Vec<String>,
        uploads: Vec<(String, usize)>,
        deleted: Vec<String>,
    }

    type SharedBoard = Arc<Mutex<Board>>;
    type Params = Query<HashMap<String, String>>;

    async fn rr_connect(Query(params): Params) -> Json<Value> {
        if params.get("password").map(String::as_str) == Some("wrong") {
            return Json(json!({ "err": 1 }));
        }
        Json(json!({ "err": 0, "sessionTimeout": 8000, "boardType": "mb6hc" }))
    }

    async fn rr_model(Query(params): Params, State(board): State<SharedBoard>) -> Json<Value> {
        let board = board.lock().unwrap();
        let key = params.get("key").cloned().unwrap_or_default();
        let result = match key.as_str() {
            "state" => json!({ "status": board.status }),
            "job" => json!({
                "duration": null,
                "filePosition": null,
                "file": { "fileName": null, "size": 0 }
            }),
            "network" => json!({ "name": "Bench" }),
            "seqs" => json!({ "reply": board.reply_seq }),
            _ => Value::Null,
        };
        Json(json!({ "key": key, "flags": MODEL_FLAGS, "result": result }))
    }

    async fn rr_gcode(Query(params): Params, State(board): State<SharedBoard>) -> Json<Value> {
        let mut board = board.lock().unwrap();
        let code = params.get("gcode").cloned().unwrap_or_default();
        if code == "M115" {
            board.pending_reply = "FIRMWARE_NAME: RepRapFirmware for Duet 3".into();
            board.reply_seq += 1;
        }
        board.codes.push(code);
        Json(json!({ "buff": 255 }))
    }

    async fn rr_reply(State(board): State<SharedBoard>) -> String {
        std::mem::take(&mut board.lock().unwrap().pending_reply)
    }

    async fn rr_upload(
        Query(params): Params,
        State(board): State<SharedBoard>,
        body: Bytes,
    ) -> Json<Value> {
        let name = params.get("name").cloned().unwrap_or_default();
        board.lock().unwrap().uploads.push((name, body.len()));
        Json(json!({ "err": 0 }))
    }

    async fn rr_delete(Query(params): Params, State(board): State<SharedBoard>) -> Json<Value> {
        let name = params.get("name").cloned().unwrap_or_default();
        board.lock().unwrap().deleted.push(name);
        Json(json!({ "err": 0 }))
    }

    async fn rr_disconnect() -> Json<Value> {
        Json(json!({ "err": 0 }))
    }

    async fn serve_board() -> (String, SharedBoard) {
        let board: SharedBoard = Arc::new(Mutex::new(Board {
            status: "idle".into(),
            ..Board::default()
        }));
        let app = Router::new()
            .route("/rr_connect", get(rr_connect))
            .route("/rr_model", get(rr_model))
            .route("/rr_gcode", get(rr_gcode))
            .route("/rr_reply", get(rr_reply))
            .route("/rr_upload", post(rr_upload))
            .route("/rr_delete", get(rr_delete))
            .route("/rr_disconnect", get(rr_disconnect))
            .with_state(Arc::clone(&board));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move { axum::serve(listener, app).await });
        (addr.to_string(), board)
    }

    fn connector(password: &str) -> DuetConnector {
        let config = FarmConfig {
            poll_interval_ms: 10,
            reply_timeout_ms: 2_000,
            password: password.into(),
            ..FarmConfig::default()
        };
        DuetConnector::new(&config).expect("client")
    }

    #[test]
    fn base_url_adds_scheme_only_when_missing() {
        assert_eq!(base_url("duet1.local"), "http://duet1.local");
        assert_eq!(base_url("https://duet1.local/"), "https://duet1.local");
    }

    #[test]
    fn unknown_status_counts_as_busy() {
        assert_eq!(parse_status("changingTool"), MachineStatus::ChangingTool);
        assert_eq!(parse_status("processing"), MachineStatus::Processing);
        assert_eq!(parse_status("warp-drive"), MachineStatus::Busy);
    }

    #[test]
    fn diff_orders_file_before_position() {
        let old = RemoteModel::default();
        let new = RemoteModel {
            status: MachineStatus::Processing,
            file_name: Some("0:/gcodes/a.gcode".into()),
            file_size: 100,
            file_position: Some(10),
            duration: Some(3),
            ..RemoteModel::default()
        };
        let changes = diff(&old, &new);
        assert!(matches!(changes[0], FieldChange::File { size: 100, .. }));
        assert_eq!(changes[1], FieldChange::FilePosition(Some(10)));
        assert_eq!(changes[2], FieldChange::Duration(Some(3)));
        assert_eq!(changes[3], FieldChange::Status(MachineStatus::Processing));
        assert!(diff(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn connect_reads_the_object_model() {
        let (host, _board) = serve_board().await;
        let connection = connector("").connect(&host).await.expect("connect");

        assert_eq!(connection.model.status, MachineStatus::Idle);
        assert_eq!(connection.model.network_name, "Bench");
        assert!(connection.model.file_name.is_none());
        connection.session.close().await;
    }

    #[tokio::test]
    async fn wrong_password_fails_to_connect() {
        let (host, _board) = serve_board().await;
        let err = connector("wrong").connect(&host).await.err().expect("rejected");
        assert!(matches!(err, FarmError::Connect { .. }));
    }

    #[tokio::test]
    async fn unreachable_board_fails_to_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let host = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let err = connector("").connect(&host).await.err().expect("unreachable");
        assert!(matches!(err, FarmError::Connect { .. }));
    }

    #[tokio::test]
    async fn codes_return_their_reply() {
        let (host, board) = serve_board().await;
        let connection = connector("").connect(&host).await.expect("connect");

        let reply = connection.session.send_code("M115").await.expect("M115");
        assert_eq!(reply, "FIRMWARE_NAME: RepRapFirmware for Duet 3");
        let silent = connection.session.send_code("M98 P\"queue-start.g\"").await.expect("M98");
        assert!(silent.is_empty());

        assert_eq!(board.lock().unwrap().codes, ["M115", "M98 P\"queue-start.g\""]);
        connection.session.close().await;
    }

    #[tokio::test]
    async fn upload_and_delete_use_firmware_paths() {
        let (host, board) = serve_board().await;
        let connection = connector("").connect(&host).await.expect("connect");

        connection
            .session
            .upload("0:/gcodes/a.gcode", b"G28\n".to_vec(), Local::now())
            .await
            .expect("upload");
        connection.session.delete("0:/gcodes/a.gcode").await.expect("delete");

        let board = board.lock().unwrap();
        assert_eq!(board.uploads, [("0:/gcodes/a.gcode".to_string(), 4)]);
        assert_eq!(board.deleted, ["0:/gcodes/a.gcode"]);
        drop(board);
        connection.session.close().await;
    }

    #[tokio::test]
    async fn status_changes_are_pushed() {
        let (host, board) = serve_board().await;
        let mut connection = connector("").connect(&host).await.expect("connect");

        board.lock().unwrap().status = "processing".into();
        let change = tokio::time::timeout(Duration::from_secs(5), connection.changes.recv())
            .await
            .expect("change in time");
        assert_eq!(change, Some(FieldChange::Status(MachineStatus::Processing)));
        connection.session.close().await;
    }
}
