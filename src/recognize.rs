//! Text recognition using an external OCR engine.
//!
//! [`TextRecognizer`] is the narrow interface to the engine itself, and
//! [`TesseractCli`] implements it by calling the `tesseract` CLI tool.
//! [`OcrEngine`] adds everything we want on top of any engine: cached
//! capabilities, language validation, and cleanup of the recognized text.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs::{File, read_to_string},
    io::Write as _,
    sync::{Arc, LazyLock, Mutex},
};

use schemars::JsonSchema;
use tokio::sync::OnceCell;

use crate::{
    async_utils::{
        check_for_command_failure, run_command, spawn_blocking_propagating_panics,
    },
    document::{PageImage, encode_png},
    error::{RecognitionError, UnsupportedLanguageError},
    prelude::*,
};

/// Version reported when the engine doesn't mention its imaging library.
pub const UNKNOWN_VERSION: &str = "?";

/// The engine marks the end of each page with a form feed.
const PAGE_BREAK: char = '\x0C';

/// Capabilities of each `tesseract` binary we've used, cached for the
/// lifetime of the process.
static TESSERACT_CAPABILITIES: LazyLock<
    Mutex<HashMap<String, Arc<OnceCell<OcrCapabilities>>>>,
> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// The process-wide capabilities cache for `program`.
fn shared_capabilities(program: &str) -> Arc<OnceCell<OcrCapabilities>> {
    TESSERACT_CAPABILITIES
        .lock()
        .expect("lock poisoned")
        .entry(program.to_owned())
        .or_default()
        .clone()
}

/// What an OCR engine is and what it can read.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct OcrCapabilities {
    /// The engine's own version line.
    pub engine_version: String,
    /// The version line of the imaging library underneath, or `?`.
    pub imaging_version: String,
    /// Installed recognition languages.
    pub languages: Vec<String>,
}

impl OcrCapabilities {
    /// Build capabilities from the engine's multi-line version output.
    pub fn from_version_output(version_output: &str, languages: Vec<String>) -> Self {
        let (engine_version, imaging_version) = parse_version_output(version_output);
        Self {
            engine_version,
            imaging_version,
            languages,
        }
    }

    /// Fail unless `lang` is installed.
    pub fn check_language(&self, lang: &str) -> Result<(), UnsupportedLanguageError> {
        if self.languages.iter().any(|installed| installed == lang) {
            Ok(())
        } else {
            Err(UnsupportedLanguageError {
                lang: lang.to_owned(),
                supported: self.languages.clone(),
            })
        }
    }
}

/// Split version output into the engine version (the first line) and the
/// imaging library version (the first later line mentioning Leptonica).
fn parse_version_output(output: &str) -> (String, String) {
    let mut lines = output.lines().map(str::trim);
    let engine_version = lines.next().unwrap_or(UNKNOWN_VERSION).to_owned();
    let imaging_version = lines
        .find(|line| line.to_lowercase().contains("leptonica"))
        .unwrap_or(UNKNOWN_VERSION)
        .to_owned();
    (engine_version, imaging_version)
}

/// Parse the output of `tesseract --list-langs`.
fn parse_language_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of"))
        .map(str::to_owned)
        .collect()
}

/// Remove the engine's page break markers.
fn strip_page_breaks(text: &str) -> String {
    text.replace(PAGE_BREAK, "")
}

/// Interface to an external OCR engine.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// A short name for logs and error messages.
    fn name(&self) -> &str;

    /// Multi-line version information. The first line is the engine itself.
    async fn version(&self) -> Result<String, RecognitionError>;

    /// Codes of the installed recognition languages.
    async fn installed_languages(&self) -> Result<Vec<String>, RecognitionError>;

    /// Recognize the text on a page.
    async fn recognize(
        &self,
        page: &PageImage,
        lang: &str,
    ) -> Result<String, RecognitionError>;
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractCli {
    /// The `tesseract` binary to run.
    program: String,
}

impl TesseractCli {
    /// Create a new `tesseract` engine.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `tesseract` with `args` and return whatever it printed. Some
    /// versions print informational output on stderr, so we fall back to
    /// that when stdout is empty.
    async fn query(&self, args: &[&str]) -> Result<String, RecognitionError> {
        let output = run_command(&self.program, args).await.map_err(|source| {
            RecognitionError::EngineUnavailable {
                program: self.program.clone(),
                source,
            }
        })?;
        check_for_command_failure(&self.program, &output)
            .map_err(RecognitionError::EngineFailed)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            Ok(String::from_utf8_lossy(&output.stderr).into_owned())
        } else {
            Ok(stdout.into_owned())
        }
    }
}

#[async_trait]
impl TextRecognizer for TesseractCli {
    fn name(&self) -> &str {
        &self.program
    }

    async fn version(&self) -> Result<String, RecognitionError> {
        self.query(&["--version"]).await
    }

    async fn installed_languages(&self) -> Result<Vec<String>, RecognitionError> {
        let output = self.query(&["--list-langs"]).await?;
        Ok(parse_language_list(&output))
    }

    #[instrument(level = "debug", skip_all, fields(page = page.index, lang = lang))]
    async fn recognize(
        &self,
        page: &PageImage,
        lang: &str,
    ) -> Result<String, RecognitionError> {
        // Tesseract can't read every format we can, so hand it a PNG.
        let image = page.image.clone();
        let png_bytes = spawn_blocking_propagating_panics(move || encode_png(&image))
            .await
            .map_err(RecognitionError::Encode)?;

        // Write our input to a temporary file.
        let tmpdir =
            tempfile::TempDir::with_prefix("tesseract").map_err(RecognitionError::Io)?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        let mut input_file = File::create(&input_path).map_err(RecognitionError::Io)?;
        input_file
            .write_all(&png_bytes)
            .map_err(RecognitionError::Io)?;
        input_file.flush().map_err(RecognitionError::Io)?;
        drop(input_file);

        // Run tesseract on the input file. It appends `.txt` to the output.
        let output_base = output_path.with_extension("");
        let output = run_command(
            &self.program,
            [
                input_path.as_os_str(),
                output_base.as_os_str(),
                OsStr::new("-l"),
                OsStr::new(lang),
            ],
        )
        .await
        .map_err(|source| RecognitionError::EngineUnavailable {
            program: self.program.clone(),
            source,
        })?;
        check_for_command_failure(&self.program, &output)
            .map_err(RecognitionError::EngineFailed)?;

        read_to_string(&output_path).map_err(RecognitionError::Io)
    }
}

/// An OCR engine plus cached knowledge of what it can do.
#[derive(Clone)]
pub struct OcrEngine {
    recognizer: Arc<dyn TextRecognizer>,
    capabilities: Arc<OnceCell<OcrCapabilities>>,
}

impl OcrEngine {
    /// Wrap `recognizer`, with a capabilities cache private to this engine.
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self {
            recognizer,
            capabilities: Arc::new(OnceCell::new()),
        }
    }

    /// Use the `tesseract` CLI tool. Capabilities are shared process-wide
    /// with every other engine running the same `program`.
    pub fn tesseract(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            capabilities: shared_capabilities(&program),
            ..Self::new(Arc::new(TesseractCli::new(program)))
        }
    }

    /// Query the engine's versions and installed languages, the first time
    /// we're asked.
    pub async fn capabilities(&self) -> Result<&OcrCapabilities, RecognitionError> {
        self.capabilities
            .get_or_try_init(|| async {
                let version = self.recognizer.version().await?;
                let languages = self.recognizer.installed_languages().await?;
                let capabilities =
                    OcrCapabilities::from_version_output(&version, languages);
                debug!(
                    engine = self.recognizer.name(),
                    capabilities = ?capabilities,
                    "Queried OCR engine capabilities"
                );
                Ok::<_, RecognitionError>(capabilities)
            })
            .await
    }

    /// Fail unless `lang` is installed.
    pub async fn check_language(&self, lang: &str) -> Result<(), RecognitionError> {
        self.capabilities().await?.check_language(lang)?;
        Ok(())
    }

    /// Recognize the text on `page`, consuming it.
    ///
    /// A page that recognizes as empty returns `Ok("")`, and is never
    /// confused with a page that could not be recognized.
    pub async fn recognize(
        &self,
        page: PageImage,
        lang: &str,
    ) -> Result<String, RecognitionError> {
        self.check_language(lang).await?;
        let text = self.recognizer.recognize(&page, lang).await?;
        drop(page);
        Ok(strip_page_breaks(&text))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{DynamicImage, GenericImageView as _, Rgb, RgbImage};

    use super::*;
    use crate::error::CommandFailure;

    static TESSERACT_5_VERSION: &str = "tesseract 5.3.0
 leptonica-1.82.0
  libgif 5.2.1 : libjpeg 8d (libjpeg-turbo 2.1.2) : libpng 1.6.39 : libtiff 4.5.0 : zlib 1.2.13 : libwebp 1.2.4 : libopenjp2 2.5.0
 Found AVX2
 Found AVX
 Found FMA
 Found SSE4.1
";

    /// A recognizer that "reads" the marker pixel of each page.
    ///
    /// Page `n` is recognized as `"PAGE n\x0C"`, except that pages listed in
    /// `failing_pages` fail and pages with marker 0 are blank.
    pub(crate) struct FakeRecognizer {
        pub(crate) languages: Vec<String>,
        pub(crate) failing_pages: Vec<u8>,
        pub(crate) version_calls: AtomicUsize,
        pub(crate) recognize_calls: AtomicUsize,
    }

    impl FakeRecognizer {
        pub(crate) fn new(languages: &[&str]) -> Self {
            Self {
                languages: languages.iter().map(|&lang| lang.to_owned()).collect(),
                failing_pages: vec![],
                version_calls: AtomicUsize::new(0),
                recognize_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing_on(mut self, pages: &[u8]) -> Self {
            self.failing_pages = pages.to_vec();
            self
        }
    }

    #[async_trait]
    impl TextRecognizer for FakeRecognizer {
        fn name(&self) -> &str {
            "fake-recognizer"
        }

        async fn version(&self) -> Result<String, RecognitionError> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TESSERACT_5_VERSION.to_owned())
        }

        async fn installed_languages(&self) -> Result<Vec<String>, RecognitionError> {
            Ok(self.languages.clone())
        }

        async fn recognize(
            &self,
            page: &PageImage,
            _lang: &str,
        ) -> Result<String, RecognitionError> {
            self.recognize_calls.fetch_add(1, Ordering::SeqCst);
            let marker = page.image.get_pixel(0, 0).0[0];
            if self.failing_pages.contains(&marker) {
                Err(RecognitionError::EngineFailed(CommandFailure {
                    command: "fake-recognizer".to_owned(),
                    exit_code: Some(1),
                    output: format!("cannot read page marked {}", marker),
                }))
            } else if marker == 0 {
                Ok("\x0C".to_owned())
            } else {
                Ok(format!("PAGE {}\n\x0C", marker))
            }
        }
    }

    /// A 2x2 page whose red channel is `marker`.
    pub(crate) fn marked_page(index: usize, marker: u8) -> PageImage {
        PageImage {
            index,
            image: DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([marker, 0, 0]))),
            mime_type: "image/png",
            size_bytes: 12,
            source: "https://example.com/page.png".into(),
        }
    }

    #[test]
    fn version_output_is_split_into_engine_and_imaging_versions() {
        let (engine, imaging) = parse_version_output(TESSERACT_5_VERSION);
        assert_eq!(engine, "tesseract 5.3.0");
        assert_eq!(imaging, "leptonica-1.82.0");
    }

    #[test]
    fn missing_imaging_version_is_unknown() {
        let (engine, imaging) = parse_version_output("tesseract 3.05\n");
        assert_eq!(engine, "tesseract 3.05");
        assert_eq!(imaging, UNKNOWN_VERSION);

        let (engine, imaging) = parse_version_output("");
        assert_eq!(engine, UNKNOWN_VERSION);
        assert_eq!(imaging, UNKNOWN_VERSION);
    }

    #[test]
    fn language_list_skips_header() {
        let output = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nfra\nosd\n";
        assert_eq!(parse_language_list(output), vec!["eng", "fra", "osd"]);
        assert!(parse_language_list("List of available languages (0):\n").is_empty());
    }

    #[test]
    fn page_breaks_are_stripped() {
        assert_eq!(strip_page_breaks("HELLO\n\x0C"), "HELLO\n");
        assert_eq!(strip_page_breaks("A\x0CB\x0C"), "AB");
    }

    #[tokio::test]
    async fn capabilities_are_queried_once() -> Result<()> {
        let recognizer = Arc::new(FakeRecognizer::new(&["eng", "fra"]));
        let engine = OcrEngine::new(recognizer.clone());
        let first = engine.capabilities().await?.clone();
        let second = engine.capabilities().await?.clone();
        assert_eq!(first, second);
        assert_eq!(first.engine_version, "tesseract 5.3.0");
        assert_eq!(first.imaging_version, "leptonica-1.82.0");
        assert_eq!(first.languages, vec!["eng", "fra"]);
        assert_eq!(recognizer.version_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_language_fails_before_recognition() {
        let recognizer = Arc::new(FakeRecognizer::new(&["eng"]));
        let engine = OcrEngine::new(recognizer.clone());
        let err = engine.recognize(marked_page(1, 1), "xx").await.unwrap_err();
        match err {
            RecognitionError::UnsupportedLanguage(err) => {
                assert_eq!(err.lang, "xx");
                assert_eq!(err.supported, vec!["eng"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(recognizer.recognize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_installed_languages_is_reported() {
        let engine = OcrEngine::new(Arc::new(FakeRecognizer::new(&[])));
        let err = engine.check_language("eng").await.unwrap_err();
        assert!(err.to_string().contains("no traineddata files available"));
    }

    #[tokio::test]
    async fn recognized_text_has_no_page_breaks() -> Result<()> {
        let engine = OcrEngine::new(Arc::new(FakeRecognizer::new(&["eng"])));
        let text = engine.recognize(marked_page(1, 3), "eng").await?;
        assert_eq!(text, "PAGE 3\n");
        assert!(!text.contains(PAGE_BREAK));
        Ok(())
    }

    #[tokio::test]
    async fn failure_is_distinct_from_empty_page() -> Result<()> {
        let engine =
            OcrEngine::new(Arc::new(FakeRecognizer::new(&["eng"]).failing_on(&[2])));
        let blank = engine.recognize(marked_page(1, 0), "eng").await?;
        assert_eq!(blank, "");
        let err = engine.recognize(marked_page(2, 2), "eng").await.unwrap_err();
        assert!(err.is_page_local());
        Ok(())
    }

    #[tokio::test]
    async fn missing_engine_binary_is_not_page_local() {
        let engine = OcrEngine::new(Arc::new(TesseractCli::new("tesseract-does-not-exist")));
        let err = engine.capabilities().await.unwrap_err();
        assert!(matches!(err, RecognitionError::EngineUnavailable { .. }));
        assert!(!err.is_page_local());
    }

    #[tokio::test]
    async fn shared_capabilities_are_kept_per_binary() -> Result<()> {
        let french_only = OcrCapabilities {
            engine_version: "tesseract 5.3.0".to_owned(),
            imaging_version: "leptonica-1.82.0".to_owned(),
            languages: vec!["fra".to_owned()],
        };
        shared_capabilities("tesseract-cached-fra")
            .set(french_only.clone())
            .map_err(|err| anyhow!("cache already set: {}", err))?;

        // Engines running the same binary share what we know about it.
        let cached = OcrEngine::tesseract("tesseract-cached-fra");
        assert_eq!(cached.capabilities().await?, &french_only);
        cached.check_language("fra").await?;
        assert!(Arc::ptr_eq(
            &shared_capabilities("tesseract-cached-fra"),
            &shared_capabilities("tesseract-cached-fra")
        ));

        // A different binary has to be asked for itself.
        let other = OcrEngine::tesseract("tesseract-uncached-does-not-exist");
        let err = other.check_language("fra").await.unwrap_err();
        assert!(matches!(err, RecognitionError::EngineUnavailable { .. }));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn tesseract_reads_hello() -> Result<()> {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/hello.png");
        let bytes = std::fs::read(path)?;
        let page = PageImage::decode(path.into(), 1, &bytes)?;
        let text = OcrEngine::tesseract("tesseract").recognize(page, "eng").await?;
        assert!(text.contains("HELLO"), "unexpected text: {:?}", text);
        assert!(!text.contains(PAGE_BREAK));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn tesseract_reports_capabilities() -> Result<()> {
        let engine = OcrEngine::tesseract("tesseract");
        let capabilities = engine.capabilities().await?;
        assert!(capabilities.engine_version.starts_with("tesseract"));
        assert!(capabilities.languages.iter().any(|lang| lang == "eng"));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn tesseract_reads_blank_page_as_empty() -> Result<()> {
        let engine = OcrEngine::tesseract("tesseract");
        let mut page = marked_page(1, 255);
        page.image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 255, 255])));
        let text = engine.recognize(page, "eng").await?;
        assert_eq!(text.trim(), "");
        Ok(())
    }
}
