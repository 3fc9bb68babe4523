use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::phase::Phase;
use crate::prefs::PreferenceStore;

pub const PAYLOAD_KEY_PREFIX: &str = "script_payloads";

pub type ScriptEntry = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct PayloadSource {
    pub key: String,
    pub forced: bool,
    pub value: Value,
}

/// Gather every `script_payloads*` value in key order.
pub fn collect_sources(store: &dyn PreferenceStore) -> Vec<PayloadSource> {
    store
        .keys()
        .into_iter()
        .filter(|key| key.starts_with(PAYLOAD_KEY_PREFIX))
        .filter_map(|key| {
            let value = store.get(&key)?;
            Some(PayloadSource {
                forced: store.is_forced(&key),
                key,
                value,
            })
        })
        .collect()
}

/// Merged payload bundles, keyed by phase. A phase that appears in any
/// eligible source is present even if its merged entry holds no scripts.
#[derive(Debug, Clone, Default)]
pub struct PayloadBundles {
    by_phase: BTreeMap<Phase, ScriptEntry>,
}

impl PayloadBundles {
    pub fn load(store: &dyn PreferenceStore, debug_mode: bool) -> Self {
        Self::merge(&collect_sources(store), debug_mode)
    }

    /// Later sources overwrite earlier ones on script-name collision.
    /// Unforced sources are only honoured in debug mode.
    pub fn merge(sources: &[PayloadSource], debug_mode: bool) -> Self {
        let mut by_phase: BTreeMap<Phase, ScriptEntry> = BTreeMap::new();

        for source in sources {
            if source.forced {
                info!(key = %source.key, "payload is managed");
            } else if debug_mode {
                info!(key = %source.key, "payload is not managed; processing because debug mode is enabled");
            } else {
                info!(key = %source.key, "payload is not managed and will not be processed");
                continue;
            }

            let decoded = match decode_bundle(&source.value) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(key = %source.key, error = %err, "failed decoding script payloads");
                    continue;
                }
            };
            for (phase, entry) in decoded {
                by_phase.entry(phase).or_default().extend(entry);
            }
        }

        Self { by_phase }
    }

    /// `None` means the phase has no bundle at all, which is different from a
    /// present but empty one.
    pub fn resolve(&self, phase: Phase) -> Option<&ScriptEntry> {
        self.by_phase.get(&phase)
    }
}

fn decode_bundle(value: &Value) -> Result<Vec<(Phase, ScriptEntry)>> {
    let bundle: BTreeMap<String, Value> =
        serde_json::from_value(value.clone()).context("payload value is not a dictionary")?;
    let mut decoded = Vec::new();
    for (name, entry) in bundle {
        let Some(phase) = Phase::parse(&name).filter(|phase| phase.accepts_payloads()) else {
            debug!(context = %name, "ignoring payload context");
            continue;
        };
        let scripts: ScriptEntry = serde_json::from_value(entry)
            .with_context(|| format!("payload context {name} is not a name -> base64 map"))?;
        decoded.push((phase, scripts));
    }
    Ok(decoded)
}

pub fn decode_script(encoded: &str) -> Result<Vec<u8>> {
    let compact = encoded
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect::<String>();
    general_purpose::STANDARD
        .decode(compact.as_bytes())
        .context("payload script is not valid base64")
}

/// Write decoded script content to an owner-executable temp file. The file
/// is removed when the returned path is dropped.
pub fn materialize(content: &[u8]) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("outset-payload-")
        .tempfile()
        .context("failed creating temp file for payload script")?;
    file.write_all(content)
        .context("failed writing payload script")?;
    file.flush().context("failed flushing payload script")?;
    let path = file.into_temp_path();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed setting mode on {}", path.display()))?;
    debug!(path = %path.display(), "wrote payload to temp file");
    Ok(path)
}
