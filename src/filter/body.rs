use bytes::Bytes;
use once_cell::sync::OnceCell;

/// Body buffer that can be read as text more than once: the detection
/// modules consume it during analysis and the downstream handler still gets
/// the original bytes. Decoding happens at most once.
pub struct CachedBody {
    bytes: Bytes,
    text: OnceCell<Option<String>>,
}

impl CachedBody {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            text: OnceCell::new(),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// UTF-8 view of the body, or `None` for binary payloads.
    pub fn as_text(&self) -> Option<&str> {
        self.text
            .get_or_init(|| std::str::from_utf8(&self.bytes).ok().map(str::to_owned))
            .as_deref()
    }
}
