//! Output formatting: aligned tables or JSON.

use std::fmt::Write;

use anyhow::Result;
use clap::ValueEnum;
use ferrite_solver::{DcSweepResult, MorResult, TransferSnapshot, TransientResult};
use nalgebra::DMatrix;
use serde_json::{Value, json};

use crate::analysis::DcReport;

const COL: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Outcome of whichever analysis ran.
#[derive(Debug)]
pub enum Report {
    Dc(DcReport),
    Sweep(DcSweepResult),
    Tran(TransientResult),
    Mor(MorResult),
}

pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Table => match report {
            Report::Dc(r) => dc_table(r),
            Report::Sweep(r) => sweep_table(r),
            Report::Tran(r) => tran_table(r),
            Report::Mor(r) => mor_table(r),
        },
        OutputFormat::Json => {
            let value = match report {
                Report::Dc(r) => serde_json::to_value(r)?,
                Report::Sweep(r) => sweep_json(r),
                Report::Tran(r) => tran_json(r),
                Report::Mor(r) => mor_json(r),
            };
            serde_json::to_string_pretty(&value)?
        }
    })
}

pub fn dc_table(report: &DcReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Operating point ({} Newton iterations)", report.iterations);
    let width = report.values.iter().map(|v| v.name.len()).max().unwrap_or(0) + 3;
    for v in &report.values {
        let label = match v.unit {
            "A" => format!("I({})", v.name),
            _ => format!("V({})", v.name),
        };
        let _ = writeln!(out, "  {:<width$} = {:>14.6e} {}", label, v.value, v.unit);
    }
    out
}

/// Swept values first, then every unknown.
pub fn sweep_table(result: &DcSweepResult) -> String {
    let mut out = String::new();
    let swept: Vec<&str> = result
        .points
        .first()
        .map(|p| p.values.iter().map(|(n, _)| n.as_str()).collect())
        .unwrap_or_default();
    for name in swept.iter().copied().chain(result.names.iter().map(String::as_str)) {
        let _ = write!(out, "{:>COL$}", name);
    }
    out.push('\n');
    out.push_str(&"-".repeat(COL * (swept.len() + result.names.len())));
    out.push('\n');
    for p in &result.points {
        for (_, v) in &p.values {
            let _ = write!(out, "{:>COL$.6e}", v);
        }
        for v in p.solution.iter() {
            let _ = write!(out, "{:>COL$.6e}", v);
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "\n{} points converged, {} failed",
        result.points.len(),
        result.failures.len()
    );
    out
}

pub fn tran_table(result: &TransientResult) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:>COL$}", "time");
    for name in &result.names {
        let _ = write!(out, "{:>COL$}", name);
    }
    out.push('\n');
    out.push_str(&"-".repeat(COL * (1 + result.names.len())));
    out.push('\n');
    for p in &result.points {
        let _ = write!(out, "{:>COL$.6e}", p.time);
        for v in p.solution.iter() {
            let _ = write!(out, "{:>COL$.6e}", v);
        }
        out.push('\n');
    }
    let s = &result.stats;
    let _ = writeln!(
        out,
        "\n{} points ({} accepted, {} rejected steps), final state {:?}",
        result.points.len(),
        s.successful_steps,
        s.failed_steps,
        result.state
    );
    out
}

pub fn mor_table(result: &MorResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Ports: {}", result.ports.join(", "));
    let _ = writeln!(
        out,
        "Order: {} (requested {}{}{})",
        result.order,
        result.requested_order,
        if result.clamped { ", clamped" } else { "" },
        if result.breakdown { ", Krylov breakdown" } else { "" }
    );
    let _ = writeln!(out, "Expansion point: {:.6e} rad/s", result.s0);
    if let Some(rcond) = result.rcond {
        let _ = writeln!(out, "rcond(G): {:.3e}", rcond);
    }

    for (title, snapshots) in [("Original", &result.orig_tf), ("Reduced", &result.red_tf)] {
        if snapshots.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{} transfer function:", title);
        let _ = writeln!(
            out,
            "{:>6}{:>COL$}{:>8}{:>COL$}{:>COL$}",
            "step", "freq", "H", "re", "im"
        );
        for snap in snapshots {
            write_snapshot(&mut out, snap);
        }
    }

    for f in &result.failures {
        let _ = writeln!(
            out,
            "failed: {:?} step {} at {:.6e} Hz: {}",
            f.system, f.step, f.frequency, f.reason
        );
    }

    if let Some(red) = &result.reduced {
        let _ = writeln!(out, "\nReduced G:{:.6}", red.g);
        let _ = writeln!(out, "Reduced C:{:.6}", red.c);
        let _ = writeln!(out, "Reduced B:{:.6}", red.b);
        let _ = writeln!(out, "Reduced L:{:.6}", red.l);
    }
    if let Some(sparse) = &result.sparse {
        let _ = writeln!(out, "Sparse C:{:.6}", sparse.c.to_dense());
        let _ = writeln!(out, "Sparse B:{:.6}", sparse.b);
        let _ = writeln!(out, "Sparse L:{:.6}", sparse.l);
    }
    out
}

fn write_snapshot(out: &mut String, snap: &TransferSnapshot) {
    let h = &snap.h;
    for i in 0..h.nrows() {
        for j in 0..h.ncols() {
            let _ = writeln!(
                out,
                "{:>6}{:>COL$.6e}{:>8}{:>COL$.6e}{:>COL$.6e}",
                snap.step,
                snap.frequency,
                format!("({},{})", i + 1, j + 1),
                h[(i, j)].re,
                h[(i, j)].im
            );
        }
    }
}

fn tran_json(result: &TransientResult) -> Value {
    let points: Vec<Value> = result
        .points
        .iter()
        .map(|p| json!({ "time": p.time, "values": p.solution.as_slice() }))
        .collect();
    json!({
        "names": result.names,
        "state": result.state,
        "stats": result.stats,
        "points": points,
    })
}

fn sweep_json(result: &DcSweepResult) -> Value {
    let points: Vec<Value> = result
        .points
        .iter()
        .map(|p| {
            json!({
                "index": p.index,
                "swept": p.values,
                "values": p.solution.as_slice(),
                "newton_iterations": p.newton_iterations,
            })
        })
        .collect();
    json!({
        "names": result.names,
        "state": result.state,
        "points": points,
        "failures": result.failures,
    })
}

fn rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

fn snapshot_json(snap: &TransferSnapshot) -> Value {
    let h: Vec<Vec<[f64; 2]>> = snap
        .h
        .row_iter()
        .map(|r| r.iter().map(|c| [c.re, c.im]).collect())
        .collect();
    json!({ "step": snap.step, "frequency": snap.frequency, "h": h })
}

fn mor_json(result: &MorResult) -> Value {
    let mut value = json!({
        "success": result.success,
        "ports": result.ports,
        "s0": result.s0,
        "requested_order": result.requested_order,
        "order": result.order,
        "clamped": result.clamped,
        "breakdown": result.breakdown,
        "rcond": result.rcond,
        "orig_tf": result.orig_tf.iter().map(snapshot_json).collect::<Vec<_>>(),
        "red_tf": result.red_tf.iter().map(snapshot_json).collect::<Vec<_>>(),
        "failures": result.failures,
    });
    if let Some(red) = &result.reduced {
        value["reduced"] = json!({
            "g": rows(&red.g),
            "c": rows(&red.c),
            "b": rows(&red.b),
            "l": rows(&red.l),
        });
    }
    if let Some(sparse) = &result.sparse {
        value["sparse"] = json!({
            "c": rows(&sparse.c.to_dense()),
            "b": rows(&sparse.b),
            "l": rows(&sparse.l),
            "eigenvalues": sparse.eigenvalues.iter().map(|e| [e.re, e.im]).collect::<Vec<_>>(),
        });
    }
    value
}
