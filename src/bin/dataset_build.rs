use std::fs;
use std::path::PathBuf;

use castprep::{
    build_dataset, init_logging, load_observations, load_profile_stats, log_run_finish,
    log_run_start, logging_config_from_env, write_feature_table, write_selected_profiles,
    write_selected_rows, DatasetConfig, ProfileStatsTable,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config_path = env_path("CASTPREP_CONFIG_PATH", Some(1))
        .ok_or("CASTPREP_CONFIG_PATH (or first argument) is required")?;
    let input_path = env_path("CASTPREP_INPUT_PATH", Some(2))
        .ok_or("CASTPREP_INPUT_PATH (or second argument) is required")?;
    let stats_path = env_path("CASTPREP_STATS_PATH", None);
    let out_dir = env_path("CASTPREP_OUT_DIR", None).unwrap_or_else(|| PathBuf::from("data/out"));

    log_run_start(&logging_cfg, &input_path);

    let config: DatasetConfig = serde_json::from_slice(&fs::read(&config_path)?)?;
    let loaded = load_observations(&input_path)?;
    let stats: Option<ProfileStatsTable> = match &stats_path {
        Some(path) => Some(load_profile_stats(path)?),
        None => None,
    };

    println!(
        "Dataset build start | input={} rows={} profiles={} targets={}",
        input_path.display(),
        loaded.report.row_count,
        loaded.report.profile_count,
        config.targets.len()
    );

    let bundle = build_dataset(&loaded.table, &config, stats.as_ref())?;

    if bundle.selected_profiles.is_empty() {
        return Err("no profiles selected; nothing to write".into());
    }

    write_selected_profiles(&out_dir.join("selected_profiles.csv"), &bundle.selected_profiles)?;
    println!(
        "selected_profiles | rows={}",
        bundle.selected_profiles.len()
    );

    for (target, rows) in &bundle.selected_rows {
        if rows.is_empty() {
            println!("selected_rows[{target}] | empty, skipped");
            continue;
        }
        write_selected_rows(
            &out_dir.join(format!("selected_rows_{target}.csv")),
            target,
            rows,
        )?;
        println!("selected_rows[{target}] | rows={}", rows.len());
    }

    for (target, features) in &bundle.target_features {
        if features.rows.is_empty() {
            println!("target_features[{target}] | empty, skipped");
            continue;
        }
        write_feature_table(&out_dir.join(format!("features_{target}.csv")), features)?;
        println!(
            "target_features[{target}] | rows={} columns={}",
            features.rows.len(),
            features.schema.columns.len()
        );
    }

    log_run_finish(
        bundle.target_features.len(),
        bundle.selected_profiles.len(),
        &out_dir,
    );
    println!("Dataset build complete | out_dir={}", out_dir.display());

    Ok(())
}

fn env_path(var: &str, positional: Option<usize>) -> Option<PathBuf> {
    if let Ok(raw) = std::env::var(var) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    positional.and_then(|idx| std::env::args().nth(idx).map(PathBuf::from))
}
