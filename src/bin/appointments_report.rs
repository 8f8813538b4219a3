//! Appointments Report
//!
//! Opens the store read-only, rebuilds the aggregates from persisted records
//! and prints KPIs, mix views, the per-bucket series and the latest records.
//! Safe to run while `pipeline_runtime` is writing (WAL readers do not block).
//!
//! Usage:
//!   cargo run --bin appointments_report -- [LATEST_N] [STATUS]
//!
//! STATUS filters the latest records (Scheduled, Completed, Cancelled, No-Show).

use clinicflow::pipeline::{
    query::SharedEngine, rebuild_engine, AppointmentStatus, PipelineConfig, PipelineStats, QueryFacade,
    SqliteAppointmentStore, TimeRange, WindowMetric,
};
use dotenv::dotenv;
use std::sync::{Arc, RwLock};

/// Records listed when no count is given
const DEFAULT_LATEST: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut args = std::env::args().skip(1);
    let latest_n = match args.next() {
        Some(n) => n.parse::<usize>().map_err(|e| format!("invalid LATEST_N `{}`: {}", n, e))?,
        None => DEFAULT_LATEST,
    };
    let status = match args.next() {
        Some(s) => Some(AppointmentStatus::from_str(&s).ok_or_else(|| format!("unknown status `{}`", s))?),
        None => None,
    };

    let config = PipelineConfig::from_env();
    config.validate()?;

    let store = Arc::new(SqliteAppointmentStore::open_read_only(&config.db_path)?);
    let engine: SharedEngine = Arc::new(RwLock::new(rebuild_engine(store.as_ref(), &config).await?));
    let facade = QueryFacade::new(engine, store, Arc::new(PipelineStats::new()));

    let kpis = facade.get_kpis();
    println!("=== Appointments ({}) ===", config.db_path);
    println!("Total appointments : {}", kpis.total);
    println!("Total cost         : ${:.2}", kpis.total_cost);
    println!("Average cost       : ${:.2}", kpis.avg_cost);
    println!("Completion rate    : {:.1}%", kpis.completion_rate);
    println!("Average copay      : ${:.2}", kpis.avg_copay);

    println!();
    println!("--- Status mix ---");
    for entry in facade.status_mix() {
        println!("{:<10} {:>8} appts  ${:>12.2}", entry.status, entry.appointments, entry.revenue);
    }

    println!();
    println!("--- Urgency by department ---");
    for entry in facade.urgency_by_department() {
        println!("{:<20} {:<9} {:>8}", entry.department, entry.urgency, entry.appointments);
    }

    println!();
    println!("--- Payment methods ---");
    for entry in facade.payment_summary() {
        println!(
            "{:<10} avg cost ${:>9.2}  avg copay ${:>8.2}  volume {:>8}",
            entry.payment_method, entry.avg_cost, entry.avg_copay, entry.volume
        );
    }

    println!();
    println!("--- Throughput / revenue per {}s bucket ---", config.bucket_secs);
    let revenue = facade.get_window_series(WindowMetric::Revenue, TimeRange::all());
    for (count, rev) in facade
        .get_window_series(WindowMetric::Appointments, TimeRange::all())
        .iter()
        .zip(revenue.iter())
    {
        println!("{}  {:>6} appts  ${:>12.2}", count.bucket_start, count.value, rev.value);
    }

    println!();
    let latest = match status {
        Some(status) => {
            println!("--- Latest {} {} ---", latest_n, status);
            facade.latest_by_status(latest_n, status).await?
        }
        None => {
            println!("--- Latest {} ---", latest_n);
            facade.get_latest(latest_n).await?
        }
    };
    for record in latest {
        let e = &record.event;
        println!(
            "{}  {:<12} {:<10} {:<16} {:<8} ${:>9.2} (copay ${:.2})  {} / {}  v{}",
            e.timestamp, e.appointment_id, e.status, e.department, e.urgency, e.cost(), e.copay(), e.city, e.payment_method, e.version
        );
    }

    Ok(())
}
