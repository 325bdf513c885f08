// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The compile-task state machine: one client request from intake to reply. The happy path is
//! INIT → SETUP → FILE_REQ → CALL_EXEC → FILE_RESP → FINISHED; a fast-fallback local subprocess
//! may race the whole remote chain, and any remote-side failure folds into a local run when the
//! requester allows one.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future;
use hashing::{Digest, Fingerprint};
use local_output_cache::{CachedCompileResult, CachedOutput};
use log::{debug, info, warn};
use parking_lot::Mutex;
use store::ExecInput;
use subprocess::{Priority, Weight};

use fs::{FileStat, FileStatCache};

use crate::command::{CompileMode, CompilerFlags, CompilerKind, CompilerTypeSpecific};
use crate::compiler_info::CompilerInfo;
use crate::context::TaskContext;
use crate::error::{omit_duration_from_user_error, CompileError};
use crate::fingerprint::{make_deps_identifier, make_local_output_key};
use crate::input_file_task::{InputFileResult, InputFileSpec};
use crate::output_file_task::{run_output_file_task, DownloadedOutput};
use crate::remote::{CommandSpec, ExecRequest, ExecResponse};
use crate::subprocess_broker::{LocalCommand, LocalRunResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileTaskState {
    Init,
    Setup,
    FileReq,
    CallExec,
    LocalOutput,
    FileResp,
    Finished,
    LocalRun,
    LocalFinished,
}

///
/// How the requester allows this compile to be handled. The shim forwards these alongside argv.
///
#[derive(Clone, Debug, Default)]
pub struct RequesterEnv {
    /// Local execution is permitted at all.
    pub fallback: bool,
    /// Start the local compile immediately and race it against the remote chain.
    pub fast_fallback: bool,
    /// The local compiler binary, when it differs from the command name.
    pub local_compiler_path: Option<PathBuf>,
    pub envs: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub id: u64,
    pub flags: CompilerFlags,
    pub requester_env: RequesterEnv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultSource {
    Remote,
    RemoteCacheHit,
    LocalOutputCache,
    LocalFallback,
    LocalRace,
}

#[derive(Clone, Debug)]
pub struct CompileResponse {
    pub exit_status: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub output_files: Vec<PathBuf>,
    pub source: ResultSource,
    pub error: Option<String>,
    pub canceled: bool,
}

impl CompileResponse {
    fn failure(message: String, source: ResultSource) -> CompileResponse {
        CompileResponse {
            exit_status: 1,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            output_files: Vec::new(),
            source,
            error: Some(omit_duration_from_user_error(&message)),
            canceled: false,
        }
    }

    fn canceled() -> CompileResponse {
        CompileResponse {
            exit_status: 1,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            output_files: Vec::new(),
            source: ResultSource::LocalFallback,
            error: None,
            canceled: true,
        }
    }
}

///
/// The view external callbacks get of a running task: observe state, request cancellation.
///
#[derive(Clone)]
pub struct CompileTaskHandle {
    state: Arc<Mutex<CompileTaskState>>,
    canceled: Arc<AtomicBool>,
}

impl CompileTaskHandle {
    pub fn state(&self) -> CompileTaskState {
        *self.state.lock()
    }

    /// Observed when the client IPC closes: the task completes its current step, then walks to
    /// FINISHED without replying.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

pub struct CompileTask {
    ctx: Arc<TaskContext>,
    request: CompileRequest,
    trace_id: String,
    state: Arc<Mutex<CompileTaskState>>,
    canceled: Arc<AtomicBool>,
}

impl CompileTask {
    pub fn new(ctx: Arc<TaskContext>, request: CompileRequest) -> Arc<CompileTask> {
        let trace_id = format!("Task:{}", request.id);
        Arc::new(CompileTask {
            ctx,
            request,
            trace_id,
            state: Arc::new(Mutex::new(CompileTaskState::Init)),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> CompileTaskHandle {
        CompileTaskHandle {
            state: self.state.clone(),
            canceled: self.canceled.clone(),
        }
    }

    fn set_state(&self, state: CompileTaskState) {
        debug!("{} -> {state:?}", self.trace_id);
        *self.state.lock() = state;
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    ///
    /// Drives the task to completion and produces the reply.
    ///
    pub async fn run(self: Arc<CompileTask>) -> CompileResponse {
        // INIT: fork the fast-fallback local subprocess when the requester asked for the race.
        let local_race = if self.request.requester_env.fallback
            && self.request.requester_env.fast_fallback
        {
            match self.launch_local_subprocess(Priority::Low) {
                Ok(launched) => Some(launched),
                Err(err) => {
                    warn!("{} fast fallback unavailable: {err}", self.trace_id);
                    None
                }
            }
        } else {
            None
        };

        match local_race {
            None => self.remote_flow().await,
            Some(mut launched) => {
                enum RaceOutcome {
                    Remote(CompileResponse),
                    Local(Result<LocalRunResult, CompileError>),
                }
                let mut remote = pin!(self.remote_flow());
                let outcome = {
                    let mut local_wait = pin!(launched.wait());
                    match future::select(&mut remote, &mut local_wait).await {
                        future::Either::Left((response, _)) => RaceOutcome::Remote(response),
                        future::Either::Right((local, _)) => RaceOutcome::Local(local),
                    }
                };
                match outcome {
                    RaceOutcome::Remote(response) => {
                        // Remote finished first; the local subprocess is surplus.
                        launched.kill();
                        response
                    }
                    RaceOutcome::Local(Ok(local)) if local.exit_status.is_some() => {
                        info!("{} local race won", self.trace_id);
                        self.set_state(CompileTaskState::LocalRun);
                        // The in-flight remote work is dropped here: cancelled where cheap.
                        self.set_state(CompileTaskState::LocalFinished);
                        respond_with_local(local, &self.request.flags, ResultSource::LocalRace)
                    }
                    RaceOutcome::Local(_) => {
                        // The racer never ran; the remote chain is still the answer.
                        remote.await
                    }
                }
            }
        }
    }

    ///
    /// SETUP through FINISHED, falling back to a local run wherever policy says so.
    ///
    async fn remote_flow(&self) -> CompileResponse {
        match self.try_remote().await {
            Ok(response) => response,
            Err(err) => {
                info!("{} falling back: {err}", self.trace_id);
                self.fallback_local(err).await
            }
        }
    }

    async fn try_remote(&self) -> Result<CompileResponse, CompileError> {
        let flags = &self.request.flags;

        // SETUP.
        self.set_state(CompileTaskState::Setup);
        if self.is_canceled() {
            return Ok(CompileResponse::canceled());
        }

        let Some(kind) = CompilerKind::from_compiler_name(&flags.compiler_name) else {
            return Err(CompileError::FlagUnsupported(format!(
                "unknown compiler: {}",
                flags.compiler_name
            )));
        };
        let type_specific = kind.type_specific();
        if flags.requires_local_run() || !type_specific.remote_compile_supported(flags) {
            return Err(CompileError::FlagUnsupported(
                "compile must run locally".to_string(),
            ));
        }
        if flags.input_filenames.is_empty() {
            return Err(CompileError::FlagUnsupported("no input files".to_string()));
        }

        let compiler_info = self
            .ctx
            .compiler_info_cache
            .get(self.ctx.compiler_info_provider.as_ref(), flags)
            .await?;

        let mut stat_cache = FileStatCache::new(Some(self.ctx.global_stat_cache.clone()));
        let required_files = self
            .enumerate_required_files(type_specific, &compiler_info, &mut stat_cache)
            .await?;

        // FILE_REQ.
        self.set_state(CompileTaskState::FileReq);
        if self.is_canceled() {
            return Ok(CompileResponse::canceled());
        }

        let input_files: BTreeSet<PathBuf> = flags
            .input_filenames
            .iter()
            .map(|input| join_cwd(&flags.cwd, input))
            .chain(required_files.iter().cloned())
            .collect();

        // Local-output-cache probe: the fingerprint plus the hash of every input's content.
        let local_output_key = match &self.ctx.local_output_cache {
            Some(_) => Some(
                self.compute_local_output_key(&compiler_info, &input_files)
                    .await?,
            ),
            None => None,
        };
        if let (Some(cache), Some(key)) = (&self.ctx.local_output_cache, local_output_key) {
            if let Some(cached) = cache.lookup(&key) {
                info!("{} local output cache hit", self.trace_id);
                self.set_state(CompileTaskState::LocalOutput);
                let response = self.materialize_cached_outputs(cached).await?;
                self.set_state(CompileTaskState::Finished);
                return Ok(response);
            }
        }

        let mut input_results = self
            .run_input_file_tasks(&input_files, &HashMap::new(), &mut stat_cache)
            .await;
        let failed: Vec<PathBuf> = failed_inputs(&input_results);
        if !failed.is_empty() {
            // One retry with the failed set marked missed, to force re-upload past a server
            // cache eviction race.
            warn!("{} retrying {} failed inputs", self.trace_id, failed.len());
            let missed: HashMap<PathBuf, SystemTime> = failed
                .iter()
                .map(|path| (path.clone(), SystemTime::now()))
                .collect();
            let retried = self
                .run_input_file_tasks(
                    &failed.iter().cloned().collect(),
                    &missed,
                    &mut stat_cache,
                )
                .await;
            merge_results(&mut input_results, retried);
            if !failed_inputs(&input_results).is_empty() {
                return Err(CompileError::Transient(
                    "input files failed twice".to_string(),
                ));
            }
        }

        // CALL_EXEC, looping on missing inputs and command-spec updates with bounded retries.
        let mut command_spec = CommandSpec {
            name: compiler_info.name.clone(),
            version: compiler_info.version.clone(),
            target: compiler_info.target.clone(),
            binary_hash: Some(compiler_info.real_compiler_hash),
        };
        let mut attempts = 0_usize;
        let response = loop {
            self.set_state(CompileTaskState::CallExec);
            if self.is_canceled() {
                return Ok(CompileResponse::canceled());
            }

            let request = self.build_exec_request(command_spec.clone(), &input_results);
            let response = self.ctx.exec_client.exec(request).await?;

            if !response.needs_retry() {
                break response;
            }
            attempts += 1;
            if attempts > self.ctx.config.exec_retry_count {
                return Err(CompileError::Transient(format!(
                    "exec retries exhausted after {attempts} attempts"
                )));
            }
            let backoff = self.ctx.config.exec_retry_backoff * (1 << (attempts - 1)) as u32;
            tokio::time::sleep(backoff).await;

            if let Some(update) = response.command_spec_update {
                info!("{} command spec updated by server", self.trace_id);
                command_spec = update;
                continue;
            }

            // Missing inputs: re-enter FILE_REQ for exactly those files with missed content.
            self.set_state(CompileTaskState::FileReq);
            let now = SystemTime::now();
            let missing: BTreeSet<PathBuf> = response
                .missing_inputs
                .iter()
                .map(|path| join_cwd(&flags.cwd, path))
                .collect();
            info!(
                "{} re-uploading {} missing inputs",
                self.trace_id,
                missing.len()
            );
            let missed: HashMap<PathBuf, SystemTime> =
                missing.iter().map(|path| (path.clone(), now)).collect();
            let retried = self
                .run_input_file_tasks(&missing, &missed, &mut stat_cache)
                .await;
            if !failed_inputs(&retried).is_empty() {
                return Err(CompileError::MissingInput(failed_inputs(&retried)));
            }
            merge_results(&mut input_results, retried);
        };

        // FILE_RESP.
        self.set_state(CompileTaskState::FileResp);
        if self.is_canceled() {
            return Ok(CompileResponse::canceled());
        }
        let downloaded = self.download_outputs(&response).await?;

        // FINISHED.
        self.set_state(CompileTaskState::Finished);
        let output_files = self.commit_outputs(&downloaded)?;
        if response.exit_status == 0 {
            if let (Some(cache), Some(key)) = (&self.ctx.local_output_cache, local_output_key) {
                self.maybe_save_local_output(cache, &key, &response, &downloaded);
            }
        }

        Ok(CompileResponse {
            exit_status: response.exit_status,
            stdout: response.stdout,
            stderr: response.stderr,
            output_files,
            source: if response.cache_hit {
                ResultSource::RemoteCacheHit
            } else {
                ResultSource::Remote
            },
            error: None,
            canceled: false,
        })
    }

    ///
    /// The deps-cache-or-include-processor step of SETUP: reuse the recorded header set when it
    /// validates, otherwise enumerate and record.
    ///
    async fn enumerate_required_files(
        &self,
        type_specific: &'static dyn CompilerTypeSpecific,
        compiler_info: &Arc<CompilerInfo>,
        stat_cache: &mut FileStatCache,
    ) -> Result<BTreeSet<PathBuf>, CompileError> {
        let flags = &self.request.flags;
        let identifier = make_deps_identifier(compiler_info, flags);
        let use_deps_cache = type_specific.supports_deps_cache(flags);
        let primary_input = join_cwd(&flags.cwd, &flags.input_filenames[0]);

        if use_deps_cache {
            if let Some(deps) = self.ctx.deps_cache.get_dependencies(
                &identifier,
                &flags.cwd,
                &primary_input,
                stat_cache,
                &self.ctx.include_cache,
            ) {
                debug!("{} deps cache hit: {} files", self.trace_id, deps.len());
                return Ok(deps);
            }
        }

        // Include processing is synchronous CPU-and-stat work: run it off the async workers,
        // moving the task's stat cache through the closure and back.
        let ctx = self.ctx.clone();
        let flags_for_processor = flags.clone();
        let info_for_processor = compiler_info.clone();
        let gch_hack = self.ctx.config.gch_hack_enabled;
        let mut moved_stat_cache = std::mem::replace(stat_cache, FileStatCache::new(None));
        let processed = self
            .ctx
            .executor
            .spawn_blocking(move || {
                let mut caches = include_processor::IncludeProcessorCaches {
                    include_cache: &ctx.include_cache,
                    list_dir_cache: &ctx.list_dir_cache,
                    stat_cache: &mut moved_stat_cache,
                };
                let result = type_specific.run_include_processor(
                    &flags_for_processor,
                    &info_for_processor,
                    &mut caches,
                    gch_hack,
                );
                (result, moved_stat_cache)
            })
            .await
            .map_err(|e| CompileError::Transient(format!("include processor join: {e}")))?;
        let (result, returned_stat_cache) = processed;
        *stat_cache = returned_stat_cache;

        match result {
            Ok(processed) => {
                info!(
                    "{} include processor: {} files ({} considered, {} skipped)",
                    self.trace_id,
                    processed.required_files.len(),
                    processed.total_files,
                    processed.skipped_files
                );
                if use_deps_cache {
                    self.ctx.deps_cache.set_dependencies(
                        &identifier,
                        &flags.cwd,
                        &primary_input,
                        &processed.required_files,
                        stat_cache,
                        &self.ctx.include_cache,
                    );
                }
                Ok(processed.required_files)
            }
            Err(err) => {
                // A failed enumeration poisons whatever the deps cache had for this key.
                self.ctx.deps_cache.remove_dependency(&identifier);
                Err(err)
            }
        }
    }

    async fn run_input_file_tasks(
        &self,
        files: &BTreeSet<PathBuf>,
        missed: &HashMap<PathBuf, SystemTime>,
        stat_cache: &mut FileStatCache,
    ) -> Vec<InputFileResult> {
        let linking = self.request.flags.mode == CompileMode::Linking;
        let now = SystemTime::now();
        let new_file_threshold = self.ctx.config.new_file_threshold;

        let mut tasks = Vec::with_capacity(files.len());
        for file in files {
            let file_stat = stat_cache.get(file);
            let missed_at = missed.get(file).copied();
            let is_new_file = file_stat
                .mtime
                .and_then(|mtime| now.duration_since(mtime).ok())
                .map(|age| age < new_file_threshold)
                .unwrap_or(true);
            let spec = InputFileSpec {
                filename: file.clone(),
                file_stat,
                missed_at,
                missed_content: missed_at.is_some(),
                linking,
                is_new_file,
            };
            tasks.push(self.ctx.input_file_tasks.run(
                spec,
                self.ctx.blob_client.clone(),
                self.ctx.file_hash_cache.clone(),
            ));
        }
        future::join_all(tasks).await
    }

    fn build_exec_request(
        &self,
        command_spec: CommandSpec,
        input_results: &[InputFileResult],
    ) -> ExecRequest {
        let flags = &self.request.flags;
        let inputs = input_results
            .iter()
            .map(|result| ExecInput {
                filename: result.filename.clone(),
                hash_key: result.hash_key,
                inline_blob: result.inline_blob.clone(),
            })
            .collect();
        ExecRequest {
            command_spec,
            args: flags.args.clone(),
            envs: self.request.requester_env.envs.clone(),
            cwd: flags.cwd.clone(),
            inputs,
            expected_output_files: flags.output_filenames.clone(),
        }
    }

    async fn download_outputs(
        &self,
        response: &ExecResponse,
    ) -> Result<Vec<DownloadedOutput>, CompileError> {
        let cwd = self.request.flags.cwd.clone();
        let tasks = response.outputs.iter().map(|output| {
            let blob_client = self.ctx.blob_client.clone();
            let cwd = cwd.clone();
            let task_id = self.request.id;
            async move {
                match run_output_file_task(blob_client.clone(), &cwd, output, task_id).await {
                    Ok(downloaded) => Ok(downloaded),
                    Err(first_err) => {
                        // One retry before giving up on the whole compile.
                        debug!("output retry after: {first_err}");
                        run_output_file_task(blob_client, &cwd, output, task_id)
                            .await
                            .map_err(|e| {
                                CompileError::OutputDownloadFail(format!(
                                    "{}: {e}",
                                    output.filename.display()
                                ))
                            })
                    }
                }
            }
        });
        future::try_join_all(tasks).await
    }

    ///
    /// Renames every staged output into place and applies the COFF timestamp rewrite, then
    /// records final hashes so the next compile's inputs see them.
    ///
    fn commit_outputs(
        &self,
        downloaded: &[DownloadedOutput],
    ) -> Result<Vec<PathBuf>, CompileError> {
        let mut output_files = Vec::with_capacity(downloaded.len());
        for output in downloaded {
            std::fs::rename(&output.tmp_filename, &output.final_filename).map_err(|e| {
                CompileError::OutputDownloadFail(format!(
                    "rename {} -> {}: {e}",
                    output.tmp_filename.display(),
                    output.final_filename.display()
                ))
            })?;
            if output
                .final_filename
                .extension()
                .map(|e| e == "obj")
                .unwrap_or(false)
            {
                rewrite_coff_timestamp(&output.final_filename);
            }
            let file_stat = FileStat::of_path(&output.final_filename);
            if let Ok(digest) = Digest::of_file(&output.final_filename) {
                self.ctx.file_hash_cache.store_file_cache_key(
                    &output.final_filename,
                    digest.hash,
                    Some(SystemTime::now()),
                    &file_stat,
                );
            }
            output_files.push(output.final_filename.clone());
        }
        Ok(output_files)
    }

    async fn compute_local_output_key(
        &self,
        compiler_info: &Arc<CompilerInfo>,
        input_files: &BTreeSet<PathBuf>,
    ) -> Result<Fingerprint, CompileError> {
        let files: Vec<PathBuf> = input_files.iter().cloned().collect();
        let hashes = self
            .ctx
            .executor
            .spawn_blocking(move || {
                files
                    .into_iter()
                    .map(|file| {
                        let digest = Digest::of_file(&file)
                            .map_err(|e| format!("hash {}: {e}", file.display()))?;
                        Ok((file.display().to_string(), digest.hash))
                    })
                    .collect::<Result<Vec<(String, Fingerprint)>, String>>()
            })
            .await
            .map_err(|e| CompileError::Transient(format!("hash join: {e}")))?
            .map_err(CompileError::Transient)?;
        Ok(make_local_output_key(
            compiler_info,
            &self.request.flags,
            &hashes,
        ))
    }

    ///
    /// LOCAL_OUTPUT: replay previously recorded outputs instead of touching the network.
    ///
    async fn materialize_cached_outputs(
        &self,
        cached: CachedCompileResult,
    ) -> Result<CompileResponse, CompileError> {
        let mut output_files = Vec::with_capacity(cached.outputs.len());
        for output in &cached.outputs {
            let final_filename = join_cwd(&self.request.flags.cwd, Path::new(&output.filename));
            let tmp_filename =
                crate::output_file_task::tmp_filename_for(&final_filename, self.request.id);
            tokio::fs::write(&tmp_filename, &output.content)
                .await
                .map_err(|e| {
                    CompileError::OutputDownloadFail(format!(
                        "write {}: {e}",
                        tmp_filename.display()
                    ))
                })?;
            set_mode(&tmp_filename, output.mode);
            std::fs::rename(&tmp_filename, &final_filename).map_err(|e| {
                CompileError::OutputDownloadFail(format!(
                    "rename into {}: {e}",
                    final_filename.display()
                ))
            })?;
            output_files.push(final_filename);
        }
        Ok(CompileResponse {
            exit_status: cached.exit_status,
            stdout: Bytes::from(cached.stdout),
            stderr: Bytes::from(cached.stderr),
            output_files,
            source: ResultSource::LocalOutputCache,
            error: None,
            canceled: false,
        })
    }

    fn maybe_save_local_output(
        &self,
        cache: &Arc<local_output_cache::LocalOutputCache>,
        key: &Fingerprint,
        response: &ExecResponse,
        downloaded: &[DownloadedOutput],
    ) {
        let mut outputs = Vec::with_capacity(downloaded.len());
        let mut total_bytes = 0_u64;
        for output in downloaded {
            let Ok(content) = std::fs::read(&output.final_filename) else {
                return;
            };
            total_bytes += content.len() as u64;
            if total_bytes > self.ctx.config.local_output_cache_max_entry_bytes {
                debug!("{} outputs too large for local output cache", self.trace_id);
                return;
            }
            outputs.push(CachedOutput {
                filename: output.final_filename.display().to_string(),
                mode: output.mode,
                content,
                hash_key: None,
            });
        }
        cache.save_output(
            key,
            &CachedCompileResult {
                exit_status: response.exit_status,
                stdout: response.stdout.to_vec(),
                stderr: response.stderr.to_vec(),
                outputs,
            },
        );
    }

    fn launch_local_subprocess(
        &self,
        priority: Priority,
    ) -> Result<crate::subprocess_broker::LaunchedSubprocess, CompileError> {
        let flags = &self.request.flags;
        let prog = self
            .request
            .requester_env
            .local_compiler_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&flags.compiler_name));
        let weight = if flags.mode == CompileMode::Linking {
            Weight::Heavy
        } else {
            Weight::Light
        };
        self.ctx.subprocess_broker.launch(LocalCommand {
            trace_id: self.trace_id.clone(),
            prog,
            argv: flags.args.clone(),
            envs: self.request.requester_env.envs.clone(),
            cwd: flags.cwd.clone(),
            priority,
            weight,
        })
    }

    ///
    /// LOCAL_RUN for a task the remote path gave up on. Without permission to fall back, the
    /// error itself is the reply.
    ///
    async fn fallback_local(&self, err: CompileError) -> CompileResponse {
        if !self.request.requester_env.fallback {
            return CompileResponse::failure(
                format!("compiler_proxy: {err}"),
                ResultSource::LocalFallback,
            );
        }

        self.set_state(CompileTaskState::LocalRun);
        let result = match self.launch_local_subprocess(Priority::High) {
            Ok(mut launched) => launched.wait().await,
            Err(launch_err) => Err(launch_err),
        };
        self.set_state(CompileTaskState::LocalFinished);
        match result {
            Ok(local) => {
                respond_with_local(local, &self.request.flags, ResultSource::LocalFallback)
            }
            Err(local_err) => CompileResponse::failure(
                format!("compiler_proxy: remote failed ({err}); local failed ({local_err})"),
                ResultSource::LocalFallback,
            ),
        }
    }
}

fn respond_with_local(
    local: LocalRunResult,
    flags: &CompilerFlags,
    source: ResultSource,
) -> CompileResponse {
    CompileResponse {
        exit_status: local.exit_status.unwrap_or(1),
        stdout: local.stdout,
        stderr: local.stderr,
        output_files: flags
            .output_filenames
            .iter()
            .map(|output| join_cwd(&flags.cwd, output))
            .collect(),
        source,
        error: None,
        canceled: false,
    }
}

fn failed_inputs(results: &[InputFileResult]) -> Vec<PathBuf> {
    results
        .iter()
        .filter(|result| !result.success)
        .map(|result| result.filename.clone())
        .collect()
}

fn merge_results(into: &mut Vec<InputFileResult>, newer: Vec<InputFileResult>) {
    for result in newer {
        match into.iter_mut().find(|r| r.filename == result.filename) {
            Some(existing) => *existing = result,
            None => into.push(result),
        }
    }
}

fn join_cwd(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// COFF object machine magics: i386, amd64, armnt, arm64.
const COFF_MACHINES: [u16; 4] = [0x014c, 0x8664, 0x01c4, 0xaa64];

///
/// Remote compiles reproduce the COFF timestamp field deterministically, which confuses
/// incremental linkers that treat it as a freshness token; stamp the current time back in.
///
fn rewrite_coff_timestamp(path: &Path) {
    let Ok(mut bytes) = std::fs::read(path) else {
        return;
    };
    if bytes.len() < 20 {
        return;
    }
    let machine = u16::from_le_bytes([bytes[0], bytes[1]]);
    if !COFF_MACHINES.contains(&machine) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    bytes[4..8].copy_from_slice(&now.to_le_bytes());
    if let Err(err) = std::fs::write(path, &bytes) {
        warn!("failed to rewrite COFF timestamp in {}: {err}", path.display());
    }
}
