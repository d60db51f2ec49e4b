//! CLI for the rollgate read-path engine.
//!
//! Offline diagnostics: rule lookups, query plans, and decoding of captured
//! storage responses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rollgate::decode::{RowDecoder, RowShape, encode_row};
use rollgate::plan::{MetricGrouping, QueryPlan, plan_aggregated_with, plan_unaggregated};
use rollgate::rules::parse_seconds;
use rollgate::target::reverse_path;
use rollgate::{GatewayConfig, RuleSet, TargetGroup, TimeFrame};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// rollgate: read-path query planning and decoding diagnostics.
#[derive(Parser)]
#[command(name = "rollgate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the precision and aggregation a metric resolves to.
    Lookup {
        /// Gateway configuration file (JSON).
        #[arg(long)]
        config: PathBuf,

        /// Metric name.
        metric: String,

        /// Query age (e.g., "0", "90m", "7d").
        #[arg(long, default_value = "0")]
        age: String,
    },

    /// Print the storage queries for a metric list.
    Plan {
        /// Gateway configuration file (JSON).
        #[arg(long)]
        config: PathBuf,

        /// Start of the range, epoch seconds.
        #[arg(long)]
        from: u32,

        /// End of the range, epoch seconds.
        #[arg(long)]
        until: u32,

        /// Maximum points per series (0 = unlimited).
        #[arg(long, default_value = "0")]
        max_points: u32,

        /// Plan storage-side aggregation instead of raw points.
        #[arg(long)]
        aggregated: bool,

        /// Storage table.
        #[arg(long, default_value = "graphite")]
        table: String,

        /// The table stores reversed paths.
        #[arg(long)]
        reversed: bool,

        /// Reference time for retention ages (defaults to --until).
        #[arg(long)]
        now: Option<u32>,

        /// Metric names.
        #[arg(required = true)]
        metrics: Vec<String>,
    },

    /// Decode a captured storage response.
    Decode {
        /// Response body file.
        file: PathBuf,

        /// Rows carry a timestamps array.
        #[arg(long)]
        unaggregated: bool,

        /// Stored paths are reversed; print display names.
        #[arg(long)]
        reversed: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Write an encoded response body for tests.
    Fixture {
        /// Output file.
        out: PathBuf,

        /// Emit timestamps arrays (equal to the times).
        #[arg(long)]
        unaggregated: bool,

        /// Rows as `name=time:value,time:value,...`.
        #[arg(required = true)]
        rows: Vec<String>,
    },
}

/// Output format for decoded rows.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values, one point per line.
    Csv,
    /// JSON array of rows.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Lookup {
            config,
            metric,
            age,
        } => cmd_lookup(&config, &metric, &age),
        Commands::Plan {
            config,
            from,
            until,
            max_points,
            aggregated,
            table,
            reversed,
            now,
            metrics,
        } => {
            let frame = TimeFrame::new(from, until, max_points);
            let target = PlanTarget {
                table,
                reversed,
                metrics,
            };
            cmd_plan(&config, frame, now.unwrap_or(until), aggregated, target)
        }
        Commands::Decode {
            file,
            unaggregated,
            reversed,
            format,
        } => cmd_decode(&file, shape(unaggregated), reversed, &format),
        Commands::Fixture {
            out,
            unaggregated,
            rows,
        } => cmd_fixture(&out, unaggregated, &rows),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn shape(unaggregated: bool) -> RowShape {
    if unaggregated {
        RowShape::Unaggregated
    } else {
        RowShape::Aggregated
    }
}

fn load_rules(config: &Path) -> Result<RuleSet, Box<dyn std::error::Error>> {
    let config = GatewayConfig::load(config)?;
    debug!(patterns = config.rules.patterns.len(), "configuration loaded");
    Ok(RuleSet::compile(&config.rules)?)
}

/// Implements `rollgate lookup <metric>`.
fn cmd_lookup(config: &Path, metric: &str, age: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rules = load_rules(config)?;
    let age = parse_seconds(age)?;
    let hit = rules.lookup(metric, age);

    println!("metric:    {metric}");
    println!("age:       {age}s");
    println!("precision: {}s", hit.precision);
    println!("function:  {}", hit.function);

    let matched: Vec<String> = rules
        .patterns()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.matches(metric))
        .map(|(i, _)| i.to_string())
        .collect();
    if matched.is_empty() {
        println!("patterns:  none (defaults)");
    } else {
        println!("patterns:  {}", matched.join(", "));
    }
    Ok(())
}

/// Target description for `rollgate plan`.
struct PlanTarget {
    table: String,
    reversed: bool,
    metrics: Vec<String>,
}

/// Implements `rollgate plan <metrics...>`.
fn cmd_plan(
    config: &Path,
    frame: TimeFrame,
    now: u32,
    aggregated: bool,
    target: PlanTarget,
) -> Result<(), Box<dyn std::error::Error>> {
    if frame.until < frame.from {
        return Err("--until must not be before --from".into());
    }
    let rules = Arc::new(load_rules(config)?);
    let mut group = TargetGroup::from_triples(
        target.table,
        rules,
        target.metrics.iter().map(|m| (m.as_str(), m.as_str(), m.as_str())),
    );
    if target.reversed {
        group = group.reversed(false);
    }

    let plan = if aggregated {
        // a lone target group is its own common step
        let grouping = MetricGrouping::resolve(&group, &frame, now);
        let common = grouping.step_contribution()?;
        plan_aggregated_with(&group, &frame, grouping, common)?
    } else {
        plan_unaggregated(&group, &frame, now)
    };

    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &QueryPlan) {
    println!("mode:  {:?}", plan.mode);
    println!("step:  {}s", plan.step);
    println!("range: {}..={}", plan.from, plan.until);
    println!();

    println!("metrics:");
    for (metric, rule) in &plan.grouping.rules {
        println!("  {metric}: precision={}s function={}", rule.precision, rule.function);
    }
    println!();

    for (i, query) in plan.queries.iter().enumerate() {
        let function = query.function.map_or("raw".to_string(), |f| f.to_string());
        println!(
            "query {i}: table={} function={function} metrics={}",
            query.table,
            query.external.rows()
        );
        println!("  {}", query.text);
    }
}

/// Implements `rollgate decode <file>`.
fn cmd_decode(
    file: &Path,
    shape: RowShape,
    reversed: bool,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = std::fs::read(file)?;
    let mut decoder = RowDecoder::new(shape);
    decoder.feed(&body);

    let mut rows = Vec::new();
    while let Some(row) = decoder.next_row(true)? {
        rows.push(row);
    }
    debug!(rows = rows.len(), bytes = body.len(), "response decoded");

    let name_of = |raw: &[u8]| {
        let name = String::from_utf8_lossy(raw);
        if reversed {
            reverse_path(&name)
        } else {
            name.into_owned()
        }
    };

    match format {
        OutputFormat::Csv => {
            println!("# rows={}", rows.len());
            println!("name,time,value,timestamp");
            for row in &rows {
                let name = name_of(&row.name[..]);
                for (i, (time, value)) in row.times.iter().zip(&row.values).enumerate() {
                    println!("{name},{time},{value},{}", row.timestamp(i));
                }
            }
        }
        OutputFormat::Json => {
            let json_rows: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "name": name_of(&row.name[..]),
                        "times": row.times,
                        "values": row.values,
                        "timestamps": row.timestamps,
                    })
                })
                .collect();
            let output = serde_json::json!({
                "count": rows.len(),
                "rows": json_rows,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `rollgate fixture <out> <rows...>`.
fn cmd_fixture(
    out: &Path,
    unaggregated: bool,
    rows: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut body = Vec::new();
    for row in rows {
        let (name, points) = parse_fixture_row(row)?;
        let times: Vec<u32> = points.iter().map(|(t, _)| *t).collect();
        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        let timestamps = unaggregated.then_some(times.as_slice());
        encode_row(&mut body, name.as_bytes(), &times, &values, timestamps);
    }
    std::fs::write(out, &body)?;
    println!("wrote {} row(s), {} bytes to {}", rows.len(), body.len(), out.display());
    Ok(())
}

/// Parses `name=time:value,time:value`.
fn parse_fixture_row(row: &str) -> Result<(&str, Vec<(u32, f64)>), Box<dyn std::error::Error>> {
    let (name, points) = row
        .split_once('=')
        .ok_or_else(|| format!("row '{row}' must look like name=time:value,..."))?;

    let points = points
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| -> Result<(u32, f64), Box<dyn std::error::Error>> {
            let (time, value) = p
                .split_once(':')
                .ok_or_else(|| format!("point '{p}' must look like time:value"))?;
            Ok((time.trim().parse()?, value.trim().parse()?))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name, points))
}
