use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use fastrace::future::FutureExt;
use fastrace::Span;
use log::{debug, info};
use sift_common::config::{AppConfig, NamespaceConfig};
use sift_results::{Cancellation, ResultStream, RetrievalMode};

use crate::entity::{read_entity, read_feed, read_messages, read_sid, Entity};
use crate::error::{JobError, JobResult};
use crate::pagination::{Page, PageSource, PaginationCursor};
use crate::state::{JobHandle, JobState, JobStatus};
use crate::transport::{Method, Response, Transport};

const STATUS_BAD_REQUEST: u16 = 400;
const STATUS_NOT_FOUND: u16 = 404;

/// Options for dispatching a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Runs the search over a sliding time window until it is cancelled.
    pub realtime: bool,
    pub earliest_time: Option<String>,
    pub latest_time: Option<String>,
    /// The maximum number of results the job keeps.
    pub max_count: Option<usize>,
    /// The maximum number of seconds the job runs.
    pub max_time: Option<u64>,
    pub status_buckets: Option<usize>,
}

impl DispatchOptions {
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            earliest_time: Some("rt".to_string()),
            latest_time: Some("rt".to_string()),
            ..Default::default()
        }
    }

    fn search_mode(&self) -> &'static str {
        if self.realtime {
            "realtime"
        } else {
            "normal"
        }
    }

    /// The parameters of the request, with the names prefixed for saved search dispatch.
    fn to_params(&self, prefix: &str) -> Vec<(String, String)> {
        let mut params = vec![];
        let mut add = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                params.push((format!("{prefix}{name}"), value));
            }
        };
        add("earliest_time", self.earliest_time.clone());
        add("latest_time", self.latest_time.clone());
        add("max_count", self.max_count.map(|x| x.to_string()));
        add("max_time", self.max_time.map(|x| x.to_string()));
        add("status_buckets", self.status_buckets.map(|x| x.to_string()));
        params
    }
}

/// Issues REST requests in the configured namespace.
#[derive(Clone)]
struct RestClient {
    transport: Arc<dyn Transport>,
    namespace: NamespaceConfig,
}

impl RestClient {
    fn path(&self, endpoint: &str) -> String {
        match (&self.namespace.owner, &self.namespace.app) {
            (Some(owner), Some(app)) => format!("servicesNS/{owner}/{app}/{endpoint}"),
            _ => format!("services/{endpoint}"),
        }
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
    ) -> JobResult<Response> {
        let path = self.path(endpoint);
        let span = Span::enter_with_local_parent("RestClient::request")
            .with_property(|| ("method", method.to_string()))
            .with_property(|| ("path", path.clone()));
        let response = self
            .transport
            .issue_request(method, &path, params)
            .in_span(span)
            .await?;
        debug!("{method} {path} returned status {}", response.status);
        Ok(response)
    }

    /// Issues a request and fails unless the status indicates success.
    async fn request_ok(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
    ) -> JobResult<Response> {
        let response = self.request(method, endpoint, params).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(failure(response).await)
        }
    }

    async fn read(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
    ) -> JobResult<Bytes> {
        let response = self.request_ok(method, endpoint, params).await?;
        Ok(response.read_to_end().await?)
    }
}

/// Converts an unsuccessful response into an error with the messages in its body.
async fn failure(response: Response) -> JobError {
    let status = response.status;
    let messages = match response.read_to_end().await {
        Ok(body) => read_messages(&body),
        Err(e) => vec![e.to_string()],
    };
    JobError::RequestFailed { status, messages }
}

fn job_not_found(sid: &str) -> impl FnOnce(JobError) -> JobError + '_ {
    move |e| match e {
        JobError::RequestFailed {
            status: STATUS_NOT_FOUND,
            ..
        } => JobError::JobNotFound(sid.to_string()),
        e => e,
    }
}

fn dispatch_rejected(e: JobError) -> JobError {
    match e {
        JobError::RequestFailed {
            status: STATUS_BAD_REQUEST,
            messages,
        } => JobError::DispatchRejected(messages),
        e => e,
    }
}

fn output_params(count: usize) -> Vec<(String, String)> {
    vec![
        ("output_mode".to_string(), "xml".to_string()),
        ("count".to_string(), count.to_string()),
    ]
}

fn job_endpoint(sid: &str) -> String {
    format!("search/jobs/{sid}")
}

fn results_endpoint(sid: &str, mode: RetrievalMode) -> String {
    let name = match mode {
        RetrievalMode::Results => "results",
        RetrievalMode::Preview => "results_preview",
        RetrievalMode::Events => "events",
    };
    format!("search/jobs/{sid}/{name}")
}

/// Drives the lifecycle of search jobs on the server.
///
/// The controller does not poll on its own. Callers decide how often to call
/// [`JobController::poll`] and how long to wait for a job.
pub struct JobController {
    client: RestClient,
    queue_size: usize,
    results_page_size: usize,
    jobs_page_size: usize,
}

impl JobController {
    pub fn new(transport: Arc<dyn Transport>, config: &AppConfig) -> Self {
        Self {
            client: RestClient {
                transport,
                namespace: config.namespace.clone(),
            },
            queue_size: config.results.subscriber_queue_size,
            results_page_size: config.results.page_size,
            jobs_page_size: config.jobs.page_size,
        }
    }

    /// Submits a search and returns a handle in the queued state.
    pub async fn dispatch(&self, query: &str, options: &DispatchOptions) -> JobResult<JobHandle> {
        let params = search_params(query, "normal", options)?;
        let body = self
            .client
            .read(Method::Post, "search/jobs", &params)
            .await
            .map_err(dispatch_rejected)?;
        let sid = read_sid(&body)?;
        info!("dispatched job {sid}");
        Ok(JobHandle::new(sid, Utc::now(), options.realtime))
    }

    /// Dispatches a saved search. The options override the schedule of the saved search.
    pub async fn dispatch_saved(
        &self,
        name: &str,
        options: &DispatchOptions,
    ) -> JobResult<JobHandle> {
        let params = options.to_params("dispatch.");
        let body = self
            .client
            .read(
                Method::Post,
                &format!("saved/searches/{name}/dispatch"),
                &params,
            )
            .await
            .map_err(dispatch_rejected)?;
        let sid = read_sid(&body)?;
        info!("dispatched job {sid} for saved search {name}");
        Ok(JobHandle::new(sid, Utc::now(), options.realtime))
    }

    /// Returns a handle for a job that already exists on the server.
    pub async fn get(&self, sid: &str) -> JobResult<JobHandle> {
        let entity = self.fetch(sid).await?;
        JobHandle::from_entity(sid.to_string(), &entity)
    }

    /// Issues one status check and updates the cached state of the handle.
    /// The handle is left unchanged if the check fails.
    pub async fn poll(&self, handle: &mut JobHandle) -> JobResult<JobState> {
        let entity = self.fetch(handle.id()).await?;
        let status = JobStatus::from_entity(&entity)?;
        let previous = handle.state();
        handle.apply(status);
        if handle.state() != previous {
            debug!("job {} is {}", handle.id(), handle.state());
        }
        Ok(handle.state())
    }

    /// Opens the results of the job in the given mode.
    pub async fn open_results(
        &self,
        handle: &JobHandle,
        mode: RetrievalMode,
    ) -> JobResult<ResultStream> {
        handle.check_ready(mode)?;
        let response = self
            .client
            .request_ok(
                Method::Get,
                &results_endpoint(handle.id(), mode),
                &output_params(self.results_page_size),
            )
            .await
            .map_err(job_not_found(handle.id()))?;
        if handle.is_realtime() {
            let cancellation = handle.cancellation().clone();
            return Ok(ResultStream::realtime(
                mode,
                response.body,
                self.queue_size,
                cancellation,
            ));
        }
        Ok(ResultStream::new(mode, response.body, self.queue_size))
    }

    /// Requests the job to stop and keep the results it has produced so far.
    ///
    /// A running job becomes finalizing, and a later poll observes the job
    /// as done or failed. Cancelling a job that is already finalizing, done
    /// or failed does nothing.
    pub async fn cancel(&self, handle: &mut JobHandle) -> JobResult<()> {
        match handle.state() {
            JobState::Finalizing | JobState::Done | JobState::Failed => return Ok(()),
            JobState::Queued | JobState::Parsing | JobState::Running => {}
        }
        let params = vec![("action".to_string(), "finalize".to_string())];
        self.client
            .read(
                Method::Post,
                &format!("{}/control", job_endpoint(handle.id())),
                &params,
            )
            .await
            .map_err(job_not_found(handle.id()))?;
        if handle.state() == JobState::Running {
            handle.set_state(JobState::Finalizing);
        }
        info!("requested finalization of job {}", handle.id());
        Ok(())
    }

    /// Deletes the job and its results from the server.
    /// Deleting a job that no longer exists succeeds.
    pub async fn remove(&self, handle: &JobHandle) -> JobResult<()> {
        let endpoint = job_endpoint(handle.id());
        let response = self.client.request(Method::Delete, &endpoint, &[]).await?;
        if response.is_success() || response.status == STATUS_NOT_FOUND {
            debug!("removed job {}", handle.id());
            Ok(())
        } else {
            Err(failure(response).await)
        }
    }

    /// Enumerates the jobs spawned by a saved search.
    ///
    /// Jobs that are removed on the server disappear from the listing,
    /// so a job seen in one page may be missing from the next.
    pub fn history(&self, name: &str) -> PaginationCursor<JobPages> {
        let pages = JobPages {
            client: self.client.clone(),
            endpoint: format!("saved/searches/{name}/history"),
        };
        PaginationCursor::new(pages, self.jobs_page_size)
    }

    /// Enumerates all jobs visible in the namespace.
    pub fn jobs(&self) -> PaginationCursor<JobPages> {
        let pages = JobPages {
            client: self.client.clone(),
            endpoint: "search/jobs".to_string(),
        };
        PaginationCursor::new(pages, self.jobs_page_size)
    }

    /// Runs a search without creating a job and streams the results as they are found.
    ///
    /// In [`RetrievalMode::Preview`] every intermediate document is delivered.
    /// In [`RetrievalMode::Results`] only the final one is, so the search
    /// cannot be realtime. A realtime export has no final batch.
    pub async fn export(
        &self,
        query: &str,
        options: &DispatchOptions,
        mode: RetrievalMode,
    ) -> JobResult<ResultStream> {
        match mode {
            RetrievalMode::Preview => {}
            RetrievalMode::Results if !options.realtime => {}
            RetrievalMode::Results => {
                return Err(JobError::invalid("a realtime export has no final results"));
            }
            RetrievalMode::Events => {
                return Err(JobError::invalid("events cannot be exported"));
            }
        }
        let mut params = search_params(query, "normal", options)?;
        params.push(("output_mode".to_string(), "xml".to_string()));
        let response = self
            .client
            .request_ok(Method::Get, "search/jobs/export", &params)
            .await
            .map_err(dispatch_rejected)?;
        if options.realtime {
            return Ok(ResultStream::realtime(
                mode,
                response.body,
                self.queue_size,
                Cancellation::new(),
            ));
        }
        Ok(ResultStream::new(mode, response.body, self.queue_size))
    }

    /// Runs a search to completion and streams its final results.
    pub async fn oneshot(&self, query: &str, options: &DispatchOptions) -> JobResult<ResultStream> {
        if options.realtime {
            return Err(JobError::invalid("a oneshot search cannot be realtime"));
        }
        let mut params = search_params(query, "oneshot", options)?;
        params.extend(output_params(self.results_page_size));
        let response = self
            .client
            .request_ok(Method::Post, "search/jobs", &params)
            .await
            .map_err(dispatch_rejected)?;
        Ok(ResultStream::new(
            RetrievalMode::Results,
            response.body,
            self.queue_size,
        ))
    }

    async fn fetch(&self, sid: &str) -> JobResult<Entity> {
        let body = self
            .client
            .read(Method::Get, &job_endpoint(sid), &[])
            .await
            .map_err(job_not_found(sid))?;
        read_entity(&body)
    }
}

fn search_params(
    query: &str,
    exec_mode: &str,
    options: &DispatchOptions,
) -> JobResult<Vec<(String, String)>> {
    if query.trim().is_empty() {
        return Err(JobError::invalid("the search query is empty"));
    }
    let mut params = vec![
        ("search".to_string(), query.to_string()),
        ("exec_mode".to_string(), exec_mode.to_string()),
        ("search_mode".to_string(), options.search_mode().to_string()),
    ];
    params.extend(options.to_params(""));
    Ok(params)
}

/// Pages of job entries from a feed endpoint.
pub struct JobPages {
    client: RestClient,
    endpoint: String,
}

#[async_trait]
impl PageSource for JobPages {
    type Item = JobHandle;

    async fn fetch_page(&self, offset: usize, count: usize) -> JobResult<Page<JobHandle>> {
        let params = vec![
            ("offset".to_string(), offset.to_string()),
            ("count".to_string(), count.to_string()),
        ];
        let body = self.client.read(Method::Get, &self.endpoint, &params).await?;
        let feed = read_feed(&body)?;
        let items = feed
            .entries
            .iter()
            .map(|entry| {
                let sid = entry.attribute("sid").unwrap_or(&entry.name).to_string();
                JobHandle::from_entity(sid, entry)
            })
            .collect::<JobResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total: feed.total,
        })
    }
}
