//! Headless predator/prey run with replay.
//!
//! Run with:
//!   cargo run --example ecosystem -p trophic-engine -- [config.json] [ticks]
//!
//! Records a run next to the config, prints population statistics, then
//! rewinds halfway, forks and re-simulates to show that the recorded future is
//! reproduced exactly.

use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use trophic_engine::prelude::*;
use trophic_engine::telemetry::init_tracing;

const PRODUCER: KindId = KindId(0);
const HERBIVORE: KindId = KindId(1);
const CARNIVORE: KindId = KindId(2);
const OMNIVORE: KindId = KindId(3);

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

/// Nutrient regrows everywhere; producers feed on their cell.
fn regrow(snapshot: &TimestepSnapshot, deltas: &mut DeltaBuffer, _ctx: &mut TickContext) {
    let grid = &snapshot.grid;
    for y in 0..grid.height() as i32 {
        for x in 0..grid.width() as i32 {
            let v = grid.get(x, y).unwrap_or(0.0);
            if v < 1.0 {
                deltas.set_cell(x, y, (v + 0.02).min(1.0));
            }
        }
    }
    for producer in snapshot.entities_of_kind(PRODUCER) {
        let v = grid.get(producer.x, producer.y).unwrap_or(0.0);
        deltas.set_cell(producer.x, producer.y, (v - 0.05).max(0.0));
    }
}

/// Consumers wander, burn energy, starve or reproduce.
fn consumers(snapshot: &TimestepSnapshot, deltas: &mut DeltaBuffer, ctx: &mut TickContext) {
    let (w, h) = (snapshot.grid.width() as i32, snapshot.grid.height() as i32);
    for record in snapshot.entities.values() {
        if record.kind == PRODUCER {
            continue;
        }
        let energy = record.field("energy").and_then(Value::as_float).unwrap_or(0.0);
        let speed = record.field("speed").and_then(Value::as_int).unwrap_or(1) as i32;
        if energy <= 0.0 {
            deltas.despawn(record.id);
            deltas.log_event(format!("{} starved", record.id));
            continue;
        }

        let x = (record.x + ctx.rng().gen_range(-speed..=speed)).clamp(0, w - 1);
        let y = (record.y + ctx.rng().gen_range(-speed..=speed)).clamp(0, h - 1);
        deltas.move_to(record.id, x, y);

        let remaining = energy - 0.5 - 0.1 * f64::from(speed);
        if remaining > 12.0 {
            let generation = record.field("generation").and_then(Value::as_int).unwrap_or(0);
            deltas.update(record.id, [("energy", Value::Float(remaining / 2.0))]);
            deltas.spawn(
                record.kind,
                x,
                y,
                [
                    ("energy", Value::Float(remaining / 2.0)),
                    ("generation", Value::Int(generation + 1)),
                    ("speed", Value::Int(i64::from(speed))),
                ],
            );
        } else {
            let gained = if record.kind == HERBIVORE || record.kind == OMNIVORE {
                f64::from(snapshot.grid.get(x, y).unwrap_or(0.0))
            } else {
                // Carnivores hunt with a fixed success chance.
                if ctx.rng().gen_bool(0.15) { 6.0 } else { 0.0 }
            };
            deltas.update(record.id, [("energy", Value::Float(remaining + gained))]);
        }
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn schema() -> anyhow::Result<Arc<SchemaRegistry>> {
    let schema = Arc::new(SchemaRegistry::new());
    for kind in ["herbivore", "carnivore", "omnivore"] {
        schema.declare_field(kind, "energy", ValueType::Float, Value::Float(10.0))?;
        schema.declare_field(kind, "generation", ValueType::Int, Value::Int(0))?;
        schema.declare_field(kind, "speed", ValueType::Int, Value::Int(1))?;
    }
    Ok(schema)
}

fn populate(run: &mut SimulationRun, seed: u64) -> anyhow::Result<()> {
    let config = run.config().clone();
    let mut ctx = TickContext::new(seed, 0);
    let mut initial = Vec::new();
    for (kind, name) in [
        (PRODUCER, "producer"),
        (HERBIVORE, "herbivore"),
        (CARNIVORE, "carnivore"),
        (OMNIVORE, "omnivore"),
    ] {
        for _ in 0..config.initial_count(name) {
            let x = ctx.rng().gen_range(0..config.grid_width as i32);
            let y = ctx.rng().gen_range(0..config.grid_height as i32);
            initial.push(Delta::spawn(kind, x, y));
        }
    }
    run.apply_delta(&initial)
        .context("failed to seed the initial population")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "ecosystem.json".to_owned());
    let ticks: u64 = match args.next() {
        Some(raw) => raw.parse().context("ticks must be a number")?,
        None => 200,
    };

    let config = RunConfig::load(&config_path)?;
    let log_path = std::path::Path::new(&config_path).with_extension("trophlog");
    if log_path.exists() {
        std::fs::remove_file(&log_path)
            .with_context(|| format!("failed to remove old log {}", log_path.display()))?;
    }

    let catalog = Arc::new(EntityCatalog::from_names(&[
        "producer",
        "herbivore",
        "carnivore",
        "omnivore",
    ])?);
    let mut run = SimulationRun::create(&log_path, &config, schema()?, catalog)?;
    run.add_system("regrow", regrow);
    run.add_system("consumers", consumers);
    populate(&mut run, config.seed)?;

    for _ in 0..ticks {
        let report = run.tick()?;
        if report.index % 20 == 0 {
            println!("{}", run.stats().summary_line());
        }
    }
    run.flush()?;
    let diagnostics = run.last_diagnostics();
    println!(
        "recorded {} steps, last tick {:?} ({} deltas)",
        run.reader().len(),
        diagnostics.total_time,
        diagnostics.deltas_applied
    );

    // Rewind halfway and re-simulate the second half.
    let end = run.pause()?;
    let expected = run.reader().read(end)?.content_hash();
    run.jump_to(end / 2)?;
    run.resume(ForkPolicy::Truncate)?;
    run.run_ticks(end - end / 2)?;
    run.flush()?;
    let replayed = run.reader().read(end)?.content_hash();
    println!(
        "re-simulated from step {}: {}",
        end / 2,
        if replayed == expected { "identical" } else { "diverged" }
    );

    let history = population_history(&run.reader(), run.catalog())?;
    let peak = history
        .iter()
        .max_by_key(|s| s.count("herbivore"))
        .map(|s| (s.index, s.count("herbivore")));
    if let Some((index, count)) = peak {
        println!("herbivore peak: {count} at step {index}");
    }

    run.close()?;
    Ok(())
}
