//! Output formatting for CLI results.
//!
//! Text output is meant for people; JSON output wraps every result in the
//! same envelope for scripting.

use std::str::FromStr;

use addon_updater::{InstallResult, Plan, PlanDiagnostics, ProgressEvent, RollbackInfo, RollbackResult};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON envelope for scripting
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// JSON envelope shared by every command.
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command: String,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(command: &str, data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            command: command.to_string(),
        }
    }
}

impl JsonResponse<()> {
    pub fn failure(command: &str, error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            command: command.to_string(),
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Plan as shown by `check` and before `update` installs.
pub fn render_plan(plan: &Plan) -> String {
    let s = &plan.summary;
    let mut out = Vec::new();
    out.push(format!("Plan {} ({})", plan.plan_id, plan.provider));
    if !s.product_name.is_empty() {
        out.push(format!("  Product:   {}", s.product_name));
    }
    out.push(format!("  Snapshot:  {} {}", s.snapshot_type, s.snapshot_number));
    out.push(format!(
        "  Actions:   {} update(s), {} delete(s), {} ignored",
        plan.update_count(),
        s.delete_count,
        s.ignored_count
    ));
    let download = if s.download_size_unknown_count > 0 {
        format!(
            "{} (+{} of unknown size)",
            format_bytes(s.download_size),
            s.download_size_unknown_count
        )
    } else {
        format_bytes(s.download_size)
    };
    out.push(format!("  Download:  {}", download));

    for package in &plan.optional_packages {
        out.push(format!(
            "  Optional:  {} [{}] detected={} selected={:?}",
            package.name, package.id, package.detected, package.selected_action
        ));
    }
    if let Some(PlanDiagnostics::Archive { owned_products, .. }) = &plan.diagnostics {
        for product in owned_products {
            out.push(format!("  Owned:     {} (productId {})", product.name, product.id));
        }
    }
    for action in &plan.actions {
        out.push(format!("    {:<6} {}", action.kind.label(), action.relative_path));
    }
    for warning in &plan.warnings {
        out.push(format!("  ! {}", warning));
    }
    out.join("\n")
}

/// One progress line; byte events render as a percentage when the total is known.
pub fn render_progress(event: &ProgressEvent) -> String {
    let step = if event.index == 0 {
        "[pkg]".to_string()
    } else {
        format!("[{}/{}]", event.index, event.total)
    };
    match (event.bytes_downloaded, event.bytes_total) {
        (Some(done), Some(total)) if total > 0 => {
            format!("{} {} {}%", step, event.message, done.saturating_mul(100) / total)
        }
        (Some(done), _) => format!("{} {} {}", step, event.message, format_bytes(done)),
        _ => format!("{} {}", step, event.message),
    }
}

pub fn render_install(result: &InstallResult) -> String {
    format!(
        "Installed {} update(s) and {} delete(s) ({} {}). Snapshot {} kept for rollback.",
        result.updated, result.deleted, result.snapshot_type, result.snapshot_number, result.snapshot_id
    )
}

pub fn render_rollback_info(info: &RollbackInfo) -> String {
    if !info.available {
        return format!(
            "No rollback available: {}",
            info.reason.as_deref().unwrap_or("no snapshot")
        );
    }
    let created = info
        .created_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    format!(
        "Rollback available: snapshot {} from {} ({} entries), {} {} -> {} {}",
        info.snapshot_id.as_deref().unwrap_or(""),
        created,
        info.entry_count,
        info.target_snapshot_type,
        info.target_snapshot_number,
        info.source_snapshot_type,
        info.source_snapshot_number
    )
}

pub fn render_rollback(result: &RollbackResult) -> String {
    format!(
        "Rolled back snapshot {}: {} restored, {} removed.",
        result.snapshot_id, result.restored, result.removed
    )
}

/// Print `data` in the requested format; `text` renders the text form.
pub fn emit<T: Serialize>(format: OutputFormat, command: &str, data: &T, text: impl FnOnce(&T) -> String) {
    match format {
        OutputFormat::Text => println!("{}", text(data)),
        OutputFormat::Json => match serde_json::to_string_pretty(&JsonResponse::success(command, data)) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: could not serialize output: {e}"),
        },
    }
}
