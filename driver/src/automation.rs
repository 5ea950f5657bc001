//! Session object coordinating dependency-closure method calls (§4.5):
//! parameter assembly, name resolution, submission and the wait loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::daemon::{DaemonClient, DaemonError, SubmitRequest, SubmitResponse};
use crate::joblist::{JobList, JobRef, Record};
use common::errors::JobError;

/// `verbose` mode (§4.5). Modeled as a sum type rather than Python's
/// `bool`-or-`str` union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Off,
    On,
    Dots,
    Log,
}

/// Callback surface for submit/ping notifications. The default no-op
/// monitor matches running without a terminal attached.
pub trait Monitor: Send + Sync {
    fn submit(&self, _method: &str) {}
    fn ping(&self) {}
}

#[derive(Debug, Default)]
pub struct NullMonitor;
impl Monitor for NullMonitor {}

/// A resolvable name in `datasets`/`jobids`: null, a `JobRef` (stringified
/// to its jobid), a list (resolved recursively), or a bare string looked up
/// in the per-kind default map.
#[derive(Debug, Clone)]
pub enum NameRef {
    Null,
    Job(JobRef),
    List(Vec<NameRef>),
    Name(String),
}

impl From<&str> for NameRef {
    fn from(s: &str) -> Self {
        NameRef::Name(s.to_string())
    }
}

impl From<JobRef> for NameRef {
    fn from(j: JobRef) -> Self {
        NameRef::Job(j)
    }
}

/// Resolves a [`NameRef`] against a per-kind default map (`defdata` or
/// `defjob`). One level of indirection through the default map is
/// followed; the terminal value must be a string. Multiple resolved
/// strings are joined with commas.
fn resolve_name(value: &NameRef, defaults: &HashMap<String, NameRef>) -> Option<String> {
    match value {
        NameRef::Null => None,
        NameRef::Job(j) => Some(j.id().to_string()),
        NameRef::List(items) => {
            let parts: Vec<String> = items.iter().filter_map(|v| resolve_name(v, defaults)).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(","))
            }
        }
        NameRef::Name(name) => match defaults.get(name) {
            Some(NameRef::List(items)) => {
                let parts: Vec<String> =
                    items.iter().filter_map(|v| resolve_name(v, &HashMap::new())).collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(","))
                }
            }
            Some(NameRef::Name(resolved)) => Some(resolved.clone()),
            Some(NameRef::Job(j)) => Some(j.id().to_string()),
            Some(NameRef::Null) | None => Some(name.clone()),
        },
    }
}

/// Either `{method: {slot: value}}` (already scoped to the dependency
/// closure) or a flat `{slot: value}` meant for the single requested
/// method, per the submission protocol's step 2.
#[derive(Debug, Clone)]
pub enum MaybeScoped<T> {
    ByMethod(HashMap<String, HashMap<String, T>>),
    Flat(HashMap<String, T>),
}

impl<T> Default for MaybeScoped<T> {
    fn default() -> Self {
        MaybeScoped::Flat(HashMap::new())
    }
}

impl<T> MaybeScoped<T> {
    /// `ByMethod` is already keyed by method name, as the dynamically-typed
    /// original detects by checking its top-level keys against the method
    /// registry; `Flat` is unambiguous here since Rust's type system
    /// already distinguishes the two shapes the original's runtime check
    /// exists to tell apart.
    fn normalize(self, method: &str) -> HashMap<String, HashMap<String, T>> {
        match self {
            MaybeScoped::ByMethod(m) => m,
            MaybeScoped::Flat(flat) => {
                let mut out = HashMap::new();
                out.insert(method.to_string(), flat);
                out
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ParamsEntry {
    options: HashMap<String, Json>,
    datasets: HashMap<String, String>,
    jobids: HashMap<String, String>,
}

/// How a visited method's resulting job should be named in `record`.
/// `Rename` applies only to the originally requested method.
#[derive(Debug, Clone)]
pub enum RecordAs {
    SameAsMethod,
    Rename(String),
}

pub struct CallMethodRequest {
    pub method: String,
    pub defopt: HashMap<String, Json>,
    pub defdata: HashMap<String, NameRef>,
    pub defjob: HashMap<String, NameRef>,
    pub options: MaybeScoped<Json>,
    pub datasets: MaybeScoped<NameRef>,
    pub jobids: MaybeScoped<NameRef>,
    pub record_in: Option<String>,
    pub record_as: RecordAs,
    pub why_build: bool,
    pub caption: Option<String>,
}

impl CallMethodRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            defopt: HashMap::new(),
            defdata: HashMap::new(),
            defjob: HashMap::new(),
            options: MaybeScoped::default(),
            datasets: MaybeScoped::default(),
            jobids: MaybeScoped::default(),
            record_in: None,
            record_as: RecordAs::SameAsMethod,
            why_build: false,
            caption: None,
        }
    }
}

static STATUS_DUMP_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_HANDLERS_INSTALLED: OnceCell<()> = OnceCell::new();

/// Installs the SIGUSR1/SIGINFO flag handlers exactly once per process.
/// Registration is additive (signal-hook chains handlers rather than
/// replacing them), which approximates the "don't hijack a non-default
/// handler" invariant without inspecting the prior `sigaction` directly.
fn ensure_signal_handlers() {
    SIGNAL_HANDLERS_INSTALLED.get_or_init(|| {
        if let Err(e) = unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGUSR1, || {
                STATUS_DUMP_REQUESTED.store(true, Ordering::SeqCst);
            })
        } {
            warn!(error = %e, "failed to register SIGUSR1 status-dump handler");
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            if let Err(e) = unsafe {
                signal_hook::low_level::register(signal_hook::consts::SIGINFO, || {
                    STATUS_DUMP_REQUESTED.store(true, Ordering::SeqCst);
                })
            } {
                warn!(error = %e, "failed to register SIGINFO status-dump handler");
            }
        }
    });
}

/// Session object bound to a single [`DaemonClient`]. Runs single-threaded
/// from the caller's perspective: `call_method` is not reentrant.
pub struct Automation {
    pub url: String,
    pub dataset: String,
    pub subjob_cookie: Option<String>,
    pub flags: HashSet<String>,
    pub monitor: Option<Arc<dyn Monitor>>,
    pub verbose: Verbosity,
    pub history: Vec<(SubmitRequest, SubmitResponse)>,
    pub record: Record,
    params: HashMap<String, ParamsEntry>,
    dep_methods: HashMap<String, HashSet<String>>,
    daemon: DaemonClient,
}

impl Automation {
    pub async fn new(daemon: DaemonClient, url: impl Into<String>, dataset: impl Into<String>) -> Result<Self, DaemonError> {
        let dep_methods = fetch_dep_methods(&daemon).await?;
        Ok(Self {
            url: url.into(),
            dataset: dataset.into(),
            subjob_cookie: None,
            flags: HashSet::new(),
            monitor: None,
            verbose: Verbosity::Off,
            history: Vec::new(),
            record: Record::new(),
            params: HashMap::new(),
            dep_methods,
            daemon,
        })
    }

    /// Re-fetches the method dependency map from `/methods/`.
    pub async fn update_methods(&mut self) -> Result<(), DaemonError> {
        self.dep_methods = fetch_dep_methods(&self.daemon).await?;
        Ok(())
    }

    fn jobs(&self) -> JobList {
        self.record.get(&None).cloned().unwrap_or_default()
    }

    /// Step 1-7 of the submission protocol.
    async fn submit(
        &mut self,
        caption: String,
        method: String,
        params: Json,
        wait: bool,
        why_build_requested: bool,
    ) -> Result<SubmitResponse, DaemonError> {
        let why_build = if !why_build_requested && self.flags.contains("why_build") {
            Some(Json::String("on_build".to_string()))
        } else {
            None
        };
        let in_why_build_mode = why_build.is_some() || why_build_requested;

        if !in_why_build_mode {
            if let Some(monitor) = &self.monitor {
                monitor.submit(&method);
            }
        }
        common::telemetry::record_job_submitted(&method);

        let request = SubmitRequest {
            caption,
            method: method.clone(),
            params,
            subjob_cookie: self.subjob_cookie.clone(),
            parent_pid: Some(std::process::id()),
            why_build,
        };

        let response = self.daemon.submit(&request).await?;

        if self.subjob_cookie.is_none() && response.why_build.is_none() {
            let mut jobs = response.jobs.clone();
            jobs.sort_by(|a, b| a.jobid.cmp(&b.jobid));
            for job in &jobs {
                info!(method = %job.method, reason = %job.reason, jobid = %job.jobid, "submitted");
            }
        }

        self.history.push((request, response.clone()));

        if wait && !response.done {
            self.wait_loop().await?;
        }

        Ok(response)
    }

    /// Polls `/status` until idle, handling progress display and the
    /// signal-driven status dump.
    async fn wait_loop(&mut self) -> Result<(), DaemonError> {
        ensure_signal_handlers();
        let start = Instant::now();
        let mut last_ping = Instant::now();
        let mut dots_since_timestamp = Instant::now();
        let full = matches!(self.verbose, Verbosity::On | Verbosity::Log);
        let mut first_probe = true;

        loop {
            let timeout = if first_probe { 0 } else { 1 };
            first_probe = false;
            let status = self
                .daemon
                .status(self.subjob_cookie.as_deref(), timeout, full)
                .await?;

            if !status.last_error.is_empty() {
                let errors: Vec<JobError> = status
                    .last_error
                    .iter()
                    .map(|(jobid, method, st)| JobError::new(jobid.clone(), method.clone(), st.clone()))
                    .collect();
                for e in &errors {
                    warn!("{}", e.format_msg());
                }
                return Err(DaemonError::JobFailed(errors));
            }

            if status.idle {
                common::telemetry::record_job_wait_seconds(
                    status.current.as_ref().and_then(|c| c.get("method")).and_then(|m| m.as_str()).unwrap_or("unknown"),
                    start.elapsed().as_secs_f64(),
                );
                break;
            }

            if STATUS_DUMP_REQUESTED.swap(false, Ordering::SeqCst) {
                info!(stacks = %status.status_stacks, "status dump requested");
            }

            if last_ping.elapsed() >= Duration::from_secs(60) {
                if let Some(monitor) = &self.monitor {
                    monitor.ping();
                }
                last_ping = Instant::now();
            }

            match self.verbose {
                Verbosity::Dots => {
                    print!(".");
                    if dots_since_timestamp.elapsed() >= Duration::from_secs(60) {
                        print!(" [{}s]", start.elapsed().as_secs());
                        dots_since_timestamp = Instant::now();
                    }
                }
                Verbosity::Log => {
                    if start.elapsed().as_secs() % 60 == 0 {
                        info!(
                            "{} seconds, still waiting ({} seconds)",
                            start.elapsed().as_secs(),
                            start.elapsed().as_secs()
                        );
                    }
                }
                Verbosity::On => {
                    print!("\relapsed {}s", start.elapsed().as_secs());
                }
                Verbosity::Off => {}
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Ok(())
    }

    /// The full dependency-closure call protocol (§4.5). Returns the jobid
    /// of the originally requested method.
    #[track_caller]
    pub async fn call_method(&mut self, request: CallMethodRequest) -> Result<String, DaemonError> {
        self.params.clear();
        let caption = request.caption.unwrap_or_else(|| format!("fsm_{}", request.method));

        let options = request.options.normalize(&request.method);
        let datasets = request.datasets.normalize(&request.method);
        let jobids = request.jobids.normalize(&request.method);

        let mut todo: Vec<String> = vec![request.method.clone()];
        let mut visited: Vec<String> = Vec::new();
        let mut visited_set: HashSet<String> = HashSet::new();

        while let Some(m) = todo.pop() {
            if visited_set.contains(&m) {
                continue;
            }
            let mut entry = ParamsEntry::default();

            if let Some(defaults) = request.defopt.get(&m) {
                if let Some(obj) = defaults.as_object() {
                    for (k, v) in obj {
                        entry.options.insert(k.clone(), v.clone());
                    }
                }
            }
            if let Some(obj) = options.get(&m) {
                for (k, v) in obj {
                    entry.options.insert(k.clone(), v.clone());
                }
            }

            if let Some(obj) = datasets.get(&m) {
                for (slot, value) in obj {
                    if let Some(resolved) = resolve_name(value, &request.defdata) {
                        entry.datasets.insert(slot.clone(), resolved);
                    }
                }
            }
            if let Some(obj) = jobids.get(&m) {
                for (slot, value) in obj {
                    if let Some(resolved) = resolve_name(value, &request.defjob) {
                        entry.jobids.insert(slot.clone(), resolved);
                    }
                }
            }

            self.params.insert(m.clone(), entry);
            visited_set.insert(m.clone());
            visited.push(m.clone());

            if let Some(deps) = self.dep_methods.get(&m) {
                for dep in deps {
                    if !visited_set.contains(dep) {
                        todo.push(dep.clone());
                    }
                }
            }
        }

        let params_json = serde_json::to_value(
            self.params
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        serde_json::json!({
                            "options": v.options,
                            "datasets": v.datasets,
                            "jobids": v.jobids,
                        }),
                    )
                })
                .collect::<HashMap<_, _>>(),
        )
        .map_err(|e| DaemonError::Decode(e.to_string()))?;

        let submitted_params = params_json.clone();
        let response = self
            .submit(caption, request.method.clone(), params_json, true, request.why_build)
            .await?;

        if !request.why_build {
            if let Some(wb) = &response.why_build {
                let location = std::panic::Location::caller();
                println!("Would have built from:");
                println!("======================");
                println!("{}", serde_json::to_string_pretty(&submitted_params).unwrap_or_default());
                println!("Could have avoided build if:");
                println!("============================");
                println!("{wb}");
                println!();
                println!("Called from {} line {}", location.file(), location.line());
                std::process::exit(0);
            }
        }

        if request.why_build {
            return Ok(response
                .why_build
                .map(|v| v.to_string())
                .unwrap_or_default());
        }

        let record_key = request.record_in;
        let mut record_list = self.record.entry(record_key.clone()).or_default().clone();
        let mut result_jobid = String::new();
        for job in &response.jobs {
            let name = if job.method == request.method {
                match &request.record_as {
                    RecordAs::Rename(new_name) => new_name.clone(),
                    RecordAs::SameAsMethod => job.method.clone(),
                }
            } else {
                job.method.clone()
            };
            record_list.push(JobRef::new(name, job.jobid.clone()));
            if job.method == request.method {
                result_jobid = job.jobid.clone();
            }
        }
        self.record.insert(record_key, record_list);

        Ok(result_jobid)
    }
}

async fn fetch_dep_methods(daemon: &DaemonClient) -> Result<HashMap<String, HashSet<String>>, DaemonError> {
    let methods = daemon.methods().await?;
    Ok(methods
        .into_iter()
        .map(|(name, info)| (name, info.dep.into_iter().collect()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_name_follows_one_level_of_default_indirection() {
        let mut defaults = HashMap::new();
        defaults.insert("source".to_string(), NameRef::Name("ds-1".to_string()));
        let value = NameRef::Name("source".to_string());
        assert_eq!(resolve_name(&value, &defaults), Some("ds-1".to_string()));
    }

    #[test]
    fn resolve_name_joins_lists_with_commas() {
        let value = NameRef::List(vec![NameRef::Name("a".into()), NameRef::Name("b".into())]);
        assert_eq!(resolve_name(&value, &HashMap::new()), Some("a,b".to_string()));
    }

    #[test]
    fn resolve_name_stringifies_jobref_to_bare_jobid() {
        let value = NameRef::Job(JobRef::new("csvimport", "job-7"));
        assert_eq!(resolve_name(&value, &HashMap::new()), Some("job-7".to_string()));
    }

    #[test]
    fn resolve_name_null_passes_through_as_none() {
        assert_eq!(resolve_name(&NameRef::Null, &HashMap::new()), None);
    }
}
