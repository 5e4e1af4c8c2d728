use crate::proxy::request::{DEFAULT_HTTP_PORT, ParsedRequest};

/// Opaque identifier for a cacheable request.
///
/// The key base is a structured encoding of (method, host, port, path) with
/// a separator that cannot occur inside any component, so distinct targets
/// never collide. The entry id is a blake3 hash of the key base and is the
/// only value that ever touches the filesystem; raw request text never
/// becomes a path component.
#[derive(Debug, Clone)]
pub(crate) struct CacheKey {
    key_base: String,
    entry_id: String,
}

impl CacheKey {
    /// Derive a key for the request, or `None` for methods that always
    /// bypass the cache (anything but GET/HEAD).
    pub(crate) fn for_request(request: &ParsedRequest) -> Option<Self> {
        if !request.is_cacheable_method() {
            return None;
        }
        // The default port is stripped so `http://host/` and `http://host:80/`
        // share an entry; the host was lowercased during parsing.
        let key_base = if request.port == DEFAULT_HTTP_PORT {
            format!("{}::{}::{}", request.method, request.host, request.path)
        } else {
            format!(
                "{}::{}:{}::{}",
                request.method, request.host, request.port, request.path
            )
        };
        Some(Self::from_key_base(key_base))
    }

    pub(super) fn from_key_base(key_base: String) -> Self {
        let entry_id = Self::entry_id_for_key(&key_base);
        Self { key_base, entry_id }
    }

    pub(super) fn key_base(&self) -> &str {
        &self.key_base
    }

    pub(super) fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub(super) fn entry_id_for_key(key_base: &str) -> String {
        blake3::hash(key_base.as_bytes()).to_hex().to_string()
    }
}
