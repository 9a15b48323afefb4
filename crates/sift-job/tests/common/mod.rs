#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use sift_common::config::AppConfig;
use sift_job::{JobController, Method, Response, Transport};
use sift_results::{ByteStream, TransportError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type ChunkSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

enum Reply {
    Body { status: u16, body: String },
    Stream { status: u16, body: ByteStream },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl Request {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A transport that answers from scripted replies, in order, per method and path.
/// A request without a scripted reply gets a 404 response.
#[derive(Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    fn push(&self, method: Method, path: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn reply(&self, method: Method, path: &str, status: u16, body: impl Into<String>) {
        self.push(
            method,
            path,
            Reply::Body {
                status,
                body: body.into(),
            },
        );
    }

    /// Scripts a successful response whose body is fed through the returned sender.
    pub fn reply_stream(&self, method: Method, path: &str) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(
            method,
            path,
            Reply::Stream {
                status: 200,
                body: UnboundedReceiverStream::new(rx).boxed(),
            },
        );
        tx
    }

    pub fn fail(&self, method: Method, path: &str, message: &str) {
        self.push(method, path, Reply::Error(message.to_string()));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|x| x.method == method && x.path == path)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn issue_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(Request {
            method,
            path: path.to_string(),
            params: params.to_vec(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&(method, path.to_string()))
            .and_then(|x| x.pop_front());
        match reply {
            Some(Reply::Body { status, body }) => Ok(Response::new(status, body_of(body))),
            Some(Reply::Stream { status, body }) => Ok(Response::new(status, body)),
            Some(Reply::Error(message)) => Err(TransportError::message(message)),
            None => Ok(Response::new(
                404,
                body_of(messages("ERROR", "Unknown resource.")),
            )),
        }
    }
}

fn body_of(body: String) -> ByteStream {
    stream::iter(vec![Ok(Bytes::from(body))]).boxed()
}

pub fn setup() -> (JobController, Arc<MockTransport>) {
    setup_with(AppConfig::defaults().unwrap())
}

pub fn setup_with(config: AppConfig) -> (JobController, Arc<MockTransport>) {
    // Only the first test in the process installs the logger.
    let _ = sift_telemetry::init_telemetry(&config.telemetry);
    let transport = Arc::new(MockTransport::default());
    let controller = JobController::new(transport.clone(), &config);
    (controller, transport)
}

pub fn sid_response(sid: &str) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<response>\n  <sid>{sid}</sid>\n</response>\n")
}

pub fn messages(kind: &str, text: &str) -> String {
    format!("<response><messages><msg type=\"{kind}\">{text}</msg></messages></response>")
}

/// The attributes of a job entry as reported by the server.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub sid: String,
    pub dispatch_state: &'static str,
    pub is_done: bool,
    pub is_failed: bool,
    pub is_finalized: bool,
    pub is_realtime: bool,
    pub progress: f64,
}

impl JobStatus {
    pub fn new(sid: &str, dispatch_state: &'static str) -> Self {
        Self {
            sid: sid.to_string(),
            dispatch_state,
            is_done: dispatch_state == "DONE",
            is_failed: dispatch_state == "FAILED",
            is_finalized: false,
            is_realtime: false,
            progress: if dispatch_state == "DONE" { 1.0 } else { 0.0 },
        }
    }

    pub fn realtime(mut self) -> Self {
        self.is_realtime = true;
        self
    }

    pub fn finalized(mut self) -> Self {
        self.is_finalized = true;
        self
    }

    fn keys(&self) -> String {
        let flag = |x: bool| if x { "1" } else { "0" };
        format!(
            r#"<s:dict>
        <s:key name="sid">{}</s:key>
        <s:key name="dispatchState">{}</s:key>
        <s:key name="doneProgress">{}</s:key>
        <s:key name="isDone">{}</s:key>
        <s:key name="isFailed">{}</s:key>
        <s:key name="isFinalized">{}</s:key>
        <s:key name="isRealTimeSearch">{}</s:key>
        <s:key name="request"><s:dict><s:key name="search">search *</s:key></s:dict></s:key>
      </s:dict>"#,
            self.sid,
            self.dispatch_state,
            self.progress,
            flag(self.is_done),
            flag(self.is_failed),
            flag(self.is_finalized),
            flag(self.is_realtime),
        )
    }

    fn entry(&self) -> String {
        format!(
            r#"<entry>
    <title>{}</title>
    <published>2024-03-01T10:15:00.000-08:00</published>
    <content type="text/xml">
      {}
    </content>
  </entry>"#,
            self.sid,
            self.keys()
        )
    }

    pub fn document(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<entry xmlns=\"http://www.w3.org/2005/Atom\" xmlns:s=\"http://dev.splunk.com/ns/rest\">{}</entry>",
            self.entry()
                .trim_start_matches("<entry>")
                .trim_end_matches("</entry>")
        )
    }
}

pub fn feed(total: usize, jobs: &[JobStatus]) -> String {
    let entries = jobs.iter().map(|x| x.entry()).collect::<String>();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:s="http://dev.splunk.com/ns/rest" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <title>jobs</title>
  <opensearch:totalResults>{total}</opensearch:totalResults>
  {entries}
</feed>"#
    )
}

/// A results document. `None` values are left out of the row.
pub fn results(preview: bool, fields: &[&str], rows: &[&[Option<&str>]]) -> String {
    let header = fields
        .iter()
        .map(|x| format!("<field>{x}</field>"))
        .collect::<String>();
    let rows = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let values = fields
                .iter()
                .zip(row.iter())
                .filter_map(|(field, value)| {
                    value.map(|v| {
                        format!("<field k='{field}'><value><text>{v}</text></value></field>")
                    })
                })
                .collect::<String>();
            format!("<result offset='{i}'>{values}</result>")
        })
        .collect::<String>();
    format!(
        "<?xml version='1.0' encoding='UTF-8'?>\n<results preview='{}'>\n<meta><fieldOrder>{header}</fieldOrder></meta>\n{rows}\n</results>\n",
        if preview { 1 } else { 0 }
    )
}
