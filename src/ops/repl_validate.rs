//! `repl-validate`: read-only consistency check over the local oplog —
//! confirms `hlc_ts` is strictly increasing within each `site_id` and
//! that the persisted `hlc_state` watermark is at or beyond every entry
//! seen, which would otherwise mean a future pull could silently skip
//! entries this site already produced.

use crate::engine::Engine;
use crate::error::Result;
use crate::ops::{now_iso, Report};

pub async fn run(engine: &Engine) -> Result<Report> {
    let started_at = now_iso();
    let (entries, _) = engine.metadata().list_oplog_since(&crate::clock::Hlc::MIN, i64::MAX).await?;
    let current_hlc = engine.metadata().current_hlc().await?;

    let mut last_by_site: std::collections::HashMap<String, crate::clock::Hlc> = std::collections::HashMap::new();
    let mut out_of_order = Vec::new();
    let mut beyond_watermark = Vec::new();

    for entry in &entries {
        let Some(hlc) = crate::clock::Hlc::parse(&entry.hlc_ts) else {
            out_of_order.push(serde_json::json!({"site_id": entry.site_id, "hlc_ts": entry.hlc_ts, "reason": "unparseable"}));
            continue;
        };
        if let Some(prev) = last_by_site.get(&entry.site_id) {
            if hlc <= *prev {
                out_of_order.push(serde_json::json!({"site_id": entry.site_id, "hlc_ts": entry.hlc_ts}));
            }
        }
        if hlc > current_hlc {
            beyond_watermark.push(serde_json::json!({"site_id": entry.site_id, "hlc_ts": entry.hlc_ts}));
        }
        last_by_site.insert(entry.site_id.clone(), hlc);
    }

    let summary = serde_json::json!({
        "entries_checked": entries.len(),
        "out_of_order": out_of_order,
        "beyond_local_watermark": beyond_watermark,
        "ok": out_of_order.is_empty() && beyond_watermark.is_empty(),
    });
    Ok(Report::new("repl-validate", started_at, summary))
}
