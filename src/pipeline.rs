//! The page pipeline, which drives one OCR job from URI to page results.

use std::{pin::pin, sync::Arc, time::Duration};

use chrono::Utc;
use clap::Args;
use futures::{StreamExt as _, stream};
use indicatif::ProgressBar;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    document::{DocumentKind, PageOutcome, PageResult},
    error::{PipelineError, RecognitionError, StoreError, error_chain},
    fetch::{Fetcher, UriFetcher},
    prelude::*,
    raster::{PdfToPpm, Rasterizer},
    recognize::OcrEngine,
    store::{FileDetails, FileRef, Job, JobStatus, JobStore, Transcript},
};

/// The language we recognize when none is specified.
pub const DEFAULT_LANG: &str = "eng";

/// Options controlling how we fetch, rasterize and recognize documents.
#[derive(Args, Clone, Debug)]
pub struct PipelineOptions {
    /// The OCR language to use.
    #[clap(long, default_value = DEFAULT_LANG)]
    pub lang: String,

    /// The resolution to rasterize PDF pages at. Defaults to the
    /// converter's own default.
    #[clap(long)]
    pub dpi: Option<u32>,

    /// Max number of pages to recognize at a time, per job.
    #[clap(short = 'j', long, default_value = "1")]
    pub page_jobs: usize,

    /// Give up on a download after this many seconds.
    #[clap(long, default_value = "60")]
    pub fetch_timeout: u64,

    /// The `tesseract` binary to use.
    #[clap(long, default_value = "tesseract")]
    pub tesseract: String,

    /// The `pdftoppm` binary to use.
    #[clap(long, default_value = "pdftoppm")]
    pub pdftoppm: String,
}

/// Everything we know about a job once it has run.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct JobReport {
    /// The job record.
    pub job: Job,

    /// What we can tell about the job's file from its URI.
    pub file: FileDetails,

    /// Per-page outcomes, in page order. Empty if the job failed before any
    /// page was recognized.
    pub pages: Vec<PageResult>,

    /// Transcripts of the pages we recognized.
    pub transcripts: Vec<Transcript>,

    /// Why the job didn't produce any pages, if it didn't.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs OCR jobs.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    rasterizer: Rasterizer,
    engine: OcrEngine,
    store: Arc<dyn JobStore>,
    page_jobs: usize,
    /// Counts pages across every job we run.
    page_progress: Option<ProgressBar>,
}

impl Pipeline {
    /// Create a pipeline which recognizes one page at a time.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        rasterizer: Rasterizer,
        engine: OcrEngine,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            fetcher,
            rasterizer,
            engine,
            store,
            page_jobs: 1,
            page_progress: None,
        }
    }

    /// Create a pipeline using our standard external tools.
    pub fn from_options(opts: &PipelineOptions, store: Arc<dyn JobStore>) -> Result<Self> {
        let fetcher = UriFetcher::new(Duration::from_secs(opts.fetch_timeout))?;
        let rasterizer = Rasterizer::new(Arc::new(PdfToPpm::new(&opts.pdftoppm, opts.dpi)));
        let engine = OcrEngine::tesseract(&opts.tesseract);
        Ok(Self::new(Arc::new(fetcher), rasterizer, engine, store)
            .with_page_jobs(opts.page_jobs))
    }

    /// Recognize up to `page_jobs` pages of each job at once.
    pub fn with_page_jobs(mut self, page_jobs: usize) -> Self {
        self.page_jobs = page_jobs.max(1);
        self
    }

    /// Count recognized pages on `pb`. Its length grows as we learn how
    /// many pages each document has.
    pub fn with_page_progress(mut self, pb: ProgressBar) -> Self {
        self.page_progress = Some(pb);
        self
    }

    /// Create a job for the document at `uri`, without running it.
    pub async fn submit(&self, uri: &str, description: &str) -> Result<Uuid, PipelineError> {
        let job = Job::new(FileRef::new(uri, description), description);
        let job_id = job.id;
        self.store.create(job).await?;
        Ok(job_id)
    }

    /// OCR the document at `uri` as a new job.
    pub async fn run(
        &self,
        uri: &str,
        lang: &str,
    ) -> Result<Vec<PageResult>, PipelineError> {
        let job_id = self.submit(uri, uri).await?;
        self.run_job(job_id, lang).await
    }

    /// Run a job that has not started yet, returning its pages in order.
    ///
    /// If some pages can't be recognized, we return the remaining pages
    /// anyway, but the job is marked as failed. An unsupported language
    /// fails before anything else happens, and leaves the job unstarted.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id, lang = lang))]
    pub async fn run_job(
        &self,
        job_id: Uuid,
        lang: &str,
    ) -> Result<Vec<PageResult>, PipelineError> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::NotStarted {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::InProgress,
            }
            .into());
        }

        // Check our language before we touch the network.
        if let Err(err) = self.engine.check_language(lang).await {
            return match err {
                RecognitionError::UnsupportedLanguage(err) => {
                    Err(PipelineError::UnsupportedLanguage(err))
                }
                err => Err(self.fail(job_id, PipelineError::Capabilities(err)).await),
            };
        }

        match self.process(&job, lang).await {
            Ok(pages) => {
                self.finish(job_id, &pages).await?;
                Ok(pages)
            }
            Err(err) => Err(self.fail(job_id, err).await),
        }
    }

    /// Fetch, split and recognize a job's document.
    async fn process(
        &self,
        job: &Job,
        lang: &str,
    ) -> Result<Vec<PageResult>, PipelineError> {
        let uri = job.file.uri.as_str();
        debug!(uri, "Fetching document");
        let document = self.fetcher.fetch(uri).await.inspect_err(|err| {
            warn!(
                uri,
                status = ?err.status(),
                not_found = err.is_not_found(),
                transient = err.is_transient(),
                "Could not fetch document"
            );
        })?;
        if document.is_empty() {
            warn!(uri, "Fetched an empty document");
        }
        self.store
            .update_file_size(job.id, document.len() as u64)
            .await?;

        let kind = document.kind();
        debug!(uri, %kind, len = document.len(), "Splitting document into pages");
        let pages = match kind {
            DocumentKind::Pdf => {
                let pages =
                    self.rasterizer.rasterize(&document).await.inspect_err(|err| {
                        warn!(exit_code = ?err.exit_code(), "Could not rasterize document");
                    })?;
                drop(document);
                pages
            }
            DocumentKind::Image => {
                debug!(
                    detected = ?document.detected_mime_type(),
                    "Decoding single-image document"
                );
                let page =
                    spawn_blocking_propagating_panics(move || document.decode_single_page())
                        .await
                        .map_err(PipelineError::Decode)?;
                vec![page]
            }
        };
        let total_pages = pages.len();
        self.store.update_total(job.id, total_pages).await?;
        if let Some(pb) = &self.page_progress {
            pb.inc_length(total_pages as u64);
        }

        let capabilities = self
            .engine
            .capabilities()
            .await
            .map_err(PipelineError::Capabilities)?;
        self.store
            .update_status(job.id, JobStatus::InProgress, None)
            .await?;

        // Pages may finish out of order, but `buffered` hands them back in
        // the order we started them.
        let engine = &self.engine;
        let mut recognized = pin!(
            stream::iter(pages)
                .map(move |page| async move {
                    let index = page.index;
                    let image_type = page.mime_type;
                    let size_bytes = page.size_bytes;
                    debug!(page = index, "Running OCR on page");
                    (index, image_type, size_bytes, engine.recognize(page, lang).await)
                })
                .buffered(self.page_jobs)
        );

        let mut results = Vec::with_capacity(total_pages);
        while let Some((page, image_type, size_bytes, result)) = recognized.next().await {
            let outcome = match result {
                Ok(text) => {
                    self.store
                        .add_transcript(Transcript {
                            job_id: job.id,
                            engine_version: capabilities.engine_version.clone(),
                            imaging_version: capabilities.imaging_version.clone(),
                            image_type: image_type.to_owned(),
                            text: text.clone(),
                            size_bytes,
                            page,
                            total_pages,
                        })
                        .await?;
                    PageOutcome::Ok { text }
                }
                Err(err) if err.is_page_local() => {
                    let error = error_chain(&err);
                    warn!(page, error = %error, "Could not recognize page");
                    PageOutcome::Failed { error }
                }
                Err(source) => return Err(PipelineError::Recognition { page, source }),
            };
            results.push(PageResult { page, outcome });
            self.store.update_progress(job.id, results.len()).await?;
            if let Some(pb) = &self.page_progress {
                pb.inc(1);
            }
        }
        Ok(results)
    }

    /// Mark a job whose pages have all been processed as complete, or as
    /// failed if any of them could not be recognized.
    async fn finish(&self, job_id: Uuid, pages: &[PageResult]) -> Result<(), StoreError> {
        let failed = pages.iter().filter(|page| !page.is_ok()).count();
        if failed == 0 {
            info!(%job_id, pages = pages.len(), "Job complete");
            self.store
                .update_status(job_id, JobStatus::Complete, Some(Utc::now()))
                .await
        } else {
            let cause = format!(
                "{}/{} pages could not be recognized",
                failed,
                pages.len()
            );
            warn!(%job_id, cause = %cause, "Job failed");
            self.record_failure(job_id, cause).await
        }
    }

    /// Mark a job as failed because of `err`, and hand `err` back.
    async fn fail(&self, job_id: Uuid, err: PipelineError) -> PipelineError {
        let cause = error_chain(&err);
        warn!(%job_id, cause = %cause, "Job failed");
        if let Err(store_err) = self.record_failure(job_id, cause).await {
            error!(%job_id, error = %store_err, "Could not record job failure");
        }
        err
    }

    async fn record_failure(&self, job_id: Uuid, cause: String) -> Result<(), StoreError> {
        self.store.record_failure(job_id, cause).await?;
        self.store
            .update_status(job_id, JobStatus::Failed, Some(Utc::now()))
            .await
    }

    /// Summarize a job after [`Pipeline::run_job`] has returned `result`.
    pub async fn report(
        &self,
        job_id: Uuid,
        result: Result<Vec<PageResult>, PipelineError>,
    ) -> Result<JobReport, StoreError> {
        let (pages, error) = match result {
            Ok(pages) => (pages, None),
            Err(err) => (vec![], Some(error_chain(&err))),
        };
        let job = self.store.get(job_id).await?;
        Ok(JobReport {
            file: job.file.details(),
            job,
            pages,
            transcripts: self.store.transcripts(job_id).await?,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use image::{DynamicImage, Rgb, RgbImage};
    use indicatif::ProgressDrawTarget;
    use reqwest::StatusCode;

    use super::*;
    use crate::{
        document::{SourceDocument, encode_png},
        error::FetchError,
        raster::tests::{FakeBehavior, FakeConverter},
        recognize::{TesseractCli, tests::FakeRecognizer},
        store::MemoryJobStore,
    };

    const IMAGE_URI: &str = "https://example.com/hello.png";
    const PDF_URI: &str = "https://example.com/scan.pdf";
    const MISSING_URI: &str = "https://example.com/missing.pdf";
    const GARBAGE_URI: &str = "https://example.com/garbage.png";

    /// Serves canned documents, and counts how often it's asked.
    struct FakeFetcher {
        documents: HashMap<&'static str, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new() -> Self {
            let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([7, 0, 0])));
            let mut documents = HashMap::new();
            documents.insert(IMAGE_URI, encode_png(&image).expect("PNG should encode"));
            documents.insert(PDF_URI, b"%PDF-1.4\n".to_vec());
            documents.insert(GARBAGE_URI, b"not an image".to_vec());
            Self {
                documents,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, uri: &str) -> Result<SourceDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.documents.get(uri) {
                Some(bytes) => Ok(SourceDocument::new(uri, bytes.clone())),
                None => Err(FetchError::Status {
                    uri: uri.to_owned(),
                    status: StatusCode::NOT_FOUND,
                }),
            }
        }
    }

    /// A store update we care about the order of.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum StoreCall {
        Total(usize),
        Status(JobStatus),
        Progress(usize),
    }

    /// Remembers the order of updates, and passes everything on to a
    /// [`MemoryJobStore`].
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryJobStore,
        calls: std::sync::Mutex<Vec<StoreCall>>,
    }

    impl RecordingStore {
        fn record(&self, call: StoreCall) {
            self.calls.lock().expect("lock poisoned").push(call);
        }

        fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl JobStore for RecordingStore {
        async fn create(&self, job: Job) -> Result<(), StoreError> {
            self.inner.create(job).await
        }

        async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
            self.inner.get(job_id).await
        }

        async fn update_progress(
            &self,
            job_id: Uuid,
            pages_processed: usize,
        ) -> Result<(), StoreError> {
            self.record(StoreCall::Progress(pages_processed));
            self.inner.update_progress(job_id, pages_processed).await
        }

        async fn update_total(
            &self,
            job_id: Uuid,
            total_files: usize,
        ) -> Result<(), StoreError> {
            self.record(StoreCall::Total(total_files));
            self.inner.update_total(job_id, total_files).await
        }

        async fn update_file_size(
            &self,
            job_id: Uuid,
            size_bytes: u64,
        ) -> Result<(), StoreError> {
            self.inner.update_file_size(job_id, size_bytes).await
        }

        async fn update_status(
            &self,
            job_id: Uuid,
            status: JobStatus,
            end_time: Option<chrono::DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.record(StoreCall::Status(status));
            self.inner.update_status(job_id, status, end_time).await
        }

        async fn record_failure(
            &self,
            job_id: Uuid,
            cause: String,
        ) -> Result<(), StoreError> {
            self.inner.record_failure(job_id, cause).await
        }

        async fn add_transcript(&self, transcript: Transcript) -> Result<(), StoreError> {
            self.inner.add_transcript(transcript).await
        }

        async fn transcripts(&self, job_id: Uuid) -> Result<Vec<Transcript>, StoreError> {
            self.inner.transcripts(job_id).await
        }
    }

    struct Harness {
        fetcher: Arc<FakeFetcher>,
        converter: Arc<FakeConverter>,
        store: Arc<MemoryJobStore>,
        pipeline: Pipeline,
    }

    fn harness(behavior: FakeBehavior, recognizer: FakeRecognizer) -> Harness {
        harness_with_engine(behavior, OcrEngine::new(Arc::new(recognizer)))
    }

    fn harness_with_engine(behavior: FakeBehavior, engine: OcrEngine) -> Harness {
        let fetcher = Arc::new(FakeFetcher::new());
        let converter = Arc::new(FakeConverter::new(behavior));
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = Pipeline::new(
            fetcher.clone(),
            Rasterizer::new(converter.clone()),
            engine,
            store.clone(),
        );
        Harness {
            fetcher,
            converter,
            store,
            pipeline,
        }
    }

    fn texts(pages: &[PageResult]) -> Vec<Option<&str>> {
        pages.iter().map(|page| page.text()).collect()
    }

    #[tokio::test]
    async fn single_image_is_page_one() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(IMAGE_URI, "hello").await?;
        let pages = h.pipeline.run_job(job_id, "eng").await?;

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[0].text(), Some("PAGE 7\n"));

        let job = h.store.get(job_id).await?;
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.end_time.is_some());
        assert_eq!((job.files_processed, job.total_files), (1, 1));
        assert!(job.file.size_bytes.is_some());

        let transcripts = h.store.transcripts(job_id).await?;
        assert_eq!(transcripts.len(), 1);
        assert_eq!(transcripts[0].image_type, "image/png");
        assert_eq!(transcripts[0].engine_version, "tesseract 5.3.0");
        assert_eq!(transcripts[0].imaging_version, "leptonica-1.82.0");
        assert_eq!(transcripts[0].total_pages, 1);
        Ok(())
    }

    #[tokio::test]
    async fn pdf_pages_come_back_in_order() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(PDF_URI, "scan").await?;
        let pages = h.pipeline.run_job(job_id, "eng").await?;

        let indices = pages.iter().map(|page| page.page).collect::<Vec<_>>();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(
            texts(&pages),
            vec![Some("PAGE 1\n"), Some("PAGE 2\n"), Some("PAGE 3\n")]
        );
        for page in &pages {
            assert!(!page.text().unwrap_or_default().contains('\x0C'));
        }

        let job = h.store.get(job_id).await?;
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!((job.files_processed, job.total_files), (3, 3));
        Ok(())
    }

    #[tokio::test]
    async fn progress_is_reported_after_each_page() -> Result<()> {
        let store = Arc::new(RecordingStore::default());
        let pipeline = Pipeline::new(
            Arc::new(FakeFetcher::new()),
            Rasterizer::new(Arc::new(FakeConverter::new(FakeBehavior::Pages(3)))),
            OcrEngine::new(Arc::new(FakeRecognizer::new(&["eng"]))),
            store.clone(),
        );
        let job_id = pipeline.submit(PDF_URI, "scan").await?;
        pipeline.run_job(job_id, "eng").await?;

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Total(3),
                StoreCall::Status(JobStatus::InProgress),
                StoreCall::Progress(1),
                StoreCall::Progress(2),
                StoreCall::Progress(3),
                StoreCall::Status(JobStatus::Complete),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn page_progress_bar_counts_pages() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let pb = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden());
        let pipeline = h.pipeline.with_page_progress(pb.clone());
        pipeline.run(PDF_URI, "eng").await?;
        pipeline.run(IMAGE_URI, "eng").await?;
        assert_eq!(pb.length(), Some(4));
        assert_eq!(pb.position(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_pages_keep_their_order() -> Result<()> {
        let h = harness(FakeBehavior::Pages(5), FakeRecognizer::new(&["eng"]));
        let pipeline = h.pipeline.with_page_jobs(4);
        let pages = pipeline.run(PDF_URI, "eng").await?;
        let indices = pages.iter().map(|page| page.page).collect::<Vec<_>>();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert_eq!(pages[4].text(), Some("PAGE 5\n"));
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_language_fails_before_fetching() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(PDF_URI, "scan").await?;
        let err = h.pipeline.run_job(job_id, "xx").await.unwrap_err();

        match err {
            PipelineError::UnsupportedLanguage(err) => assert_eq!(err.lang, "xx"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.fetcher.calls(), 0);
        let job = h.store.get(job_id).await?;
        assert_eq!(job.status, JobStatus::NotStarted);
        assert_eq!(job.failure, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_document_fails_the_job() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(MISSING_URI, "missing").await?;
        let result = h.pipeline.run_job(job_id, "eng").await;

        match &result {
            Err(PipelineError::Fetch(err)) => assert!(err.is_not_found()),
            other => panic!("unexpected result: {:?}", other),
        }
        let job = h.store.get(job_id).await?;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.end_time.is_some());
        assert!(job.failure.as_deref().unwrap_or_default().contains("404"));
        assert_eq!(job.files_processed, 0);
        assert!(h.store.transcripts(job_id).await?.is_empty());

        let report = h.pipeline.report(job_id, result).await?;
        assert!(report.pages.is_empty());
        assert!(report.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn converter_failure_fails_the_job_and_cleans_up() -> Result<()> {
        let h = harness(FakeBehavior::Fail(1), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(PDF_URI, "scan").await?;
        let err = h.pipeline.run_job(job_id, "eng").await.unwrap_err();

        match err {
            PipelineError::Raster(err) => assert_eq!(err.exit_code(), Some(1)),
            other => panic!("unexpected error: {:?}", other),
        }
        let (input, dir) = h.converter.seen_paths();
        assert!(!input.exists());
        assert!(!dir.exists());
        assert_eq!(h.store.get(job_id).await?.status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_image_fails_the_job() -> Result<()> {
        let h = harness(FakeBehavior::Pages(1), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(GARBAGE_URI, "garbage").await?;
        let err = h.pipeline.run_job(job_id, "eng").await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(h.store.get(job_id).await?.status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn page_failures_are_marked_and_fail_the_job() -> Result<()> {
        let h = harness(
            FakeBehavior::Pages(3),
            FakeRecognizer::new(&["eng"]).failing_on(&[2]),
        );
        let job_id = h.pipeline.submit(PDF_URI, "scan").await?;
        let pages = h.pipeline.run_job(job_id, "eng").await?;

        assert_eq!(pages.len(), 3);
        assert!(pages[0].is_ok());
        assert!(matches!(pages[1].outcome, PageOutcome::Failed { .. }));
        assert!(pages[2].is_ok());

        let job = h.store.get(job_id).await?;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.failure.as_deref(),
            Some("1/3 pages could not be recognized")
        );
        assert_eq!(job.files_processed, 3);

        let transcribed = h
            .store
            .transcripts(job_id)
            .await?
            .into_iter()
            .map(|transcript| transcript.page)
            .collect::<Vec<_>>();
        assert_eq!(transcribed, vec![1, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_engine_fails_before_fetching() -> Result<()> {
        let engine = OcrEngine::new(Arc::new(TesseractCli::new("tesseract-does-not-exist")));
        let h = harness_with_engine(FakeBehavior::Pages(1), engine);
        let job_id = h.pipeline.submit(IMAGE_URI, "hello").await?;
        let err = h.pipeline.run_job(job_id, "eng").await.unwrap_err();

        assert!(matches!(err, PipelineError::Capabilities(_)));
        assert_eq!(h.fetcher.calls(), 0);
        assert_eq!(h.store.get(job_id).await?.status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn running_twice_gives_the_same_text() -> Result<()> {
        let h = harness(FakeBehavior::Pages(3), FakeRecognizer::new(&["eng"]));
        let first = h.pipeline.run(PDF_URI, "eng").await?;
        let second = h.pipeline.run(PDF_URI, "eng").await?;
        assert_eq!(first, second);
        assert_eq!(h.fetcher.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn finished_jobs_cannot_run_again() -> Result<()> {
        let h = harness(FakeBehavior::Pages(1), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(IMAGE_URI, "hello").await?;
        h.pipeline.run_job(job_id, "eng").await?;
        let err = h.pipeline.run_job(job_id, "eng").await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Store(StoreError::InvalidTransition {
                from: JobStatus::Complete,
                ..
            })
        ));
        assert_eq!(h.fetcher.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn report_collects_job_pages_and_transcripts() -> Result<()> {
        let h = harness(FakeBehavior::Pages(2), FakeRecognizer::new(&["eng"]));
        let job_id = h.pipeline.submit(PDF_URI, "scan").await?;
        let result = h.pipeline.run_job(job_id, "eng").await;
        let report = h.pipeline.report(job_id, result).await?;

        assert_eq!(report.job.id, job_id);
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.transcripts.len(), 2);
        assert_eq!(report.error, None);

        let json = serde_json::to_value(&report)?;
        assert_eq!(json["job"]["status"], "COMPLETE");
        assert_eq!(json["file"]["file_name"], "scan.pdf");
        assert_eq!(json["file"]["domain"], "example.com");
        assert_eq!(json["file"]["extension"], "pdf");
        assert_eq!(json["pages"][1]["status"], "ok");
        assert!(json.get("error").is_none());
        Ok(())
    }
}
