use std::{env, fs, path::Path};

use ts_rs::TS;

fn generate_types_content() -> String {
    let header = "// This file was generated by `cargo run --bin generate_types`.\n// Do not edit this file manually.\n";

    let decls: Vec<String> = vec![
        db::models::research_task::ResearchStatus::decl(),
        db::models::research_task::ReportType::decl(),
        db::models::research_task::CreateResearchTask::decl(),
        db::models::research_task::ProgressUpdate::decl(),
        db::models::research_task::ResearchTask::decl(),
        db::models::research_task::ResearchTaskView::decl(),
        services::services::config::Config::decl(),
        services::services::config::ServerConfig::decl(),
        services::services::config::EngineConfig::decl(),
        services::services::config::LimitsConfig::decl(),
        services::services::config::DispatcherConfig::decl(),
        services::services::config::ProgressBusConfig::decl(),
        services::services::estimate::CostEstimate::decl(),
        services::services::execution_control::ControlState::decl(),
        services::services::research_events::ProgressSnapshot::decl(),
        services::services::research_events::ResearchEvent::decl(),
        research_server::routes::health::HealthStatus::decl(),
        research_server::routes::research::EstimateRequest::decl(),
        research_server::routes::research::ObserverCount::decl(),
        research_server::routes::research_ws::ClientCommand::decl(),
        utils::response::ApiResponse::<()>::decl(),
    ];

    let body = decls
        .into_iter()
        .map(|d| {
            let trimmed = d.trim_start();
            if trimmed.starts_with("export") {
                d
            } else {
                format!("export {trimmed}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{header}\n{body}\n")
}

fn main() {
    let check_mode = env::args().any(|arg| arg == "--check");
    let shared_path = Path::new("shared/types.ts");
    let generated = generate_types_content();

    if check_mode {
        let current = fs::read_to_string(shared_path).unwrap_or_default();
        if current == generated {
            println!("shared/types.ts is up to date.");
            std::process::exit(0);
        }
        eprintln!("shared/types.ts is out of date. Run `cargo run --bin generate_types`.");
        std::process::exit(1);
    }

    println!("Generating TypeScript types...");
    if let Some(parent) = shared_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        eprintln!("Failed to create {}: {}", parent.display(), e);
        std::process::exit(1);
    }
    if let Err(e) = fs::write(shared_path, generated) {
        eprintln!("Failed to write {}: {}", shared_path.display(), e);
        std::process::exit(1);
    }
    println!("TypeScript types written to {}", shared_path.display());
}
