//! Static HTML dashboard built from a recorded trace.
//!
//! Reconstructs one timeline per coroutine instance — a step line between
//! the suspended and active states, with markers where execution migrated
//! between OS threads — and embeds everything into a single
//! self-contained page (charts rendered client-side via the ECharts CDN).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::sink::record::TraceRecord;

/// An instance whose apparent lifetime exceeds this many milliseconds is
/// flagged as corrupted: its first timestamp is almost certainly garbage
/// from a torn or overwritten slot.
const CORRUPT_DURATION_MS: f64 = 1_000_000.0;

/// One coroutine's reconstructed timeline.
#[derive(Debug)]
struct Instance {
    probe_id: u64,
    start_ts: u64,
    duration_ms: f64,
    thread_count: usize,
    corrupted: bool,
    /// `[offset_ms, state]` pairs, state 1 = active.
    points: Vec<(f64, u8)>,
    /// `(offset_ms, state, tid)` at each thread migration.
    migrations: Vec<(f64, u8, u64)>,
}

/// Read the trace at `input` and write the dashboard to `output`.
pub fn generate_html(input: &Path, output: &Path) -> Result<()> {
    let file =
        File::open(input).with_context(|| format!("opening trace file {}", input.display()))?;

    let instances = reconstruct(BufReader::new(file))?;

    info!(instances = instances.len(), "topology reconstructed");

    std::fs::write(output, render(&instances))
        .with_context(|| format!("writing dashboard {}", output.display()))?;

    info!(dashboard = %output.display(), "dashboard written");
    Ok(())
}

/// Group records per probe, order them by timestamp and derive each
/// instance's timeline. Unparseable lines are skipped.
fn reconstruct<R: BufRead>(reader: R) -> Result<Vec<Instance>> {
    let mut by_probe: HashMap<u64, Vec<TraceRecord>> = HashMap::new();

    for line in reader.lines() {
        let line = line.context("reading trace line")?;
        if let Ok(record) = TraceRecord::parse_line(&line) {
            by_probe.entry(record.probe_id).or_default().push(record);
        }
    }

    let mut ids: Vec<u64> = by_probe.keys().copied().collect();
    ids.sort_unstable();

    let mut instances = Vec::with_capacity(ids.len());
    for id in ids {
        let mut events = by_probe.remove(&id).unwrap_or_default();
        events.sort_by_key(|e| e.ts);

        let start_ts = events.first().map(|e| e.ts).unwrap_or(0);
        let end_ts = events.last().map(|e| e.ts).unwrap_or(0);
        let duration_ms = (end_ts - start_ts) as f64 / 1e6;

        let mut threads = Vec::new();
        let mut points = Vec::with_capacity(events.len());
        let mut migrations = Vec::new();
        let mut last_tid = 0u64;

        for event in &events {
            let offset_ms = (event.ts - start_ts) as f64 / 1e6;
            let state = u8::from(event.is_active);
            points.push((offset_ms, state));

            if !threads.contains(&event.tid) {
                threads.push(event.tid);
            }
            if event.tid != last_tid {
                migrations.push((offset_ms, state, event.tid));
                last_tid = event.tid;
            }
        }

        instances.push(Instance {
            probe_id: id,
            start_ts,
            duration_ms,
            thread_count: threads.len(),
            corrupted: id == 0 || duration_ms > CORRUPT_DURATION_MS,
            points,
            migrations,
        });
    }

    Ok(instances)
}

fn render(instances: &[Instance]) -> String {
    let mut nav = String::new();
    let mut content = String::new();

    for inst in instances {
        let id = inst.probe_id;
        let status_tag = if inst.corrupted {
            " <span class=\"corrupt\">[CORRUPTED]</span>"
        } else {
            ""
        };

        let _ = write!(
            nav,
            r#"<div class="nav-item" onclick="openCoro('{id}')">
  <div class="nav-id">Instance #{id}{status_tag}</div>
  <div class="nav-meta">{} steps | {} threads</div>
</div>
"#,
            inst.points.len(),
            inst.thread_count,
        );

        let mut data = String::new();
        for (i, (offset_ms, state)) in inst.points.iter().enumerate() {
            if i > 0 {
                data.push(',');
            }
            let _ = write!(data, "[{offset_ms:.6},{state}]");
        }

        let mut marks = String::new();
        for (i, (offset_ms, state, tid)) in inst.migrations.iter().enumerate() {
            if i > 0 {
                marks.push(',');
            }
            let _ = write!(
                marks,
                "{{xAxis:{offset_ms:.6},yAxis:{state},value:'TID:{tid}'}}",
            );
        }

        let _ = write!(
            content,
            r#"<div id="coro-{id}" class="tab-pane">
  <div class="panel-header">
    <h1>Coroutine Journal: #{id}</h1>
    <div class="info-bar">
      <div class="info-card"><h4>Events</h4><p>{}</p></div>
      <div class="info-card"><h4>Threads</h4><p>{}</p></div>
      <div class="info-card"><h4>Duration</h4><p>{:.2} ms</p></div>
      <div class="info-card"><h4>Start TS</h4><p>{}</p></div>
    </div>
  </div>
  <div class="chart-area" id="dom-{id}"></div>
  <script>
    if (!window.chartConfigs) window.chartConfigs = {{}};
    window.chartConfigs['{id}'] = {{ data: [{data}], marks: [{marks}] }};
  </script>
</div>
"#,
            inst.points.len(),
            inst.thread_count,
            inst.duration_ms,
            inst.start_ts,
        );
    }

    let mut page = String::with_capacity(HTML_HEAD.len() + nav.len() + content.len() + HTML_TAIL.len() + 64);
    page.push_str(HTML_HEAD);
    page.push_str(&nav);
    page.push_str(HTML_MID);
    page.push_str(&content);
    page.push_str(HTML_TAIL);
    page
}

const HTML_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <title>coroTracer Topology Dashboard</title>
  <script src="https://cdn.jsdelivr.net/npm/echarts@5.5.0/dist/echarts.min.js"></script>
  <style>
    body { margin: 0; background: #0d1117; color: #c9d1d9; font-family: -apple-system, sans-serif; display: flex; height: 100vh; overflow: hidden; }
    #sidebar { width: 350px; background: #161b22; border-right: 1px solid #30363d; display: flex; flex-direction: column; }
    .side-head { padding: 25px; font-size: 1.2rem; font-weight: bold; color: #58a6ff; border-bottom: 1px solid #30363d; }
    .nav-list { flex: 1; overflow-y: auto; }
    .nav-item { padding: 18px 25px; border-bottom: 1px solid #30363d; cursor: pointer; }
    .nav-item:hover { background: #21262d; }
    .nav-item.active { background: #30363d; border-left: 5px solid #58a6ff; }
    .nav-id { font-family: monospace; font-weight: bold; margin-bottom: 5px; }
    .nav-meta { font-size: 0.8rem; color: #8b949e; }
    .corrupt { color: #f85149; font-weight: bold; }
    #viewport { flex: 1; position: relative; display: flex; flex-direction: column; }
    .tab-pane { display: none; height: 100%; flex-direction: column; padding: 35px; box-sizing: border-box; overflow-y: auto; }
    .tab-pane.active { display: flex; }
    .panel-header { margin-bottom: 30px; }
    .info-bar { display: grid; grid-template-columns: repeat(4, 1fr); gap: 20px; margin-top: 20px; }
    .info-card { background: #161b22; padding: 15px; border-radius: 8px; border: 1px solid #30363d; }
    .info-card h4 { margin: 0; font-size: 0.75rem; color: #8b949e; text-transform: uppercase; }
    .info-card p { margin: 10px 0 0 0; font-family: monospace; color: #58a6ff; font-size: 1.1rem; }
    .chart-area { flex: 1; min-height: 500px; background: #161b22; border: 1px solid #30363d; border-radius: 8px; padding: 20px; }
    .placeholder { position: absolute; top: 50%; left: 50%; transform: translate(-50%, -50%); color: #8b949e; text-align: center; }
  </style>
</head>
<body>
  <div id="sidebar">
    <div class="side-head">coroTracer Journals</div>
    <div class="nav-list">
"#;

const HTML_MID: &str = r#"    </div>
  </div>
  <div id="viewport">
    <div class="placeholder" id="init-msg"><h2>Select a Trace Instance</h2></div>
"#;

const HTML_TAIL: &str = r#"  </div>
  <script>
    var activeCharts = {};

    function openCoro(id) {
      document.getElementById('init-msg').style.display = 'none';
      document.querySelectorAll('.nav-item').forEach(el => el.classList.remove('active'));
      document.querySelectorAll('.tab-pane').forEach(el => el.classList.remove('active'));

      event.currentTarget.classList.add('active');
      document.getElementById('coro-' + id).classList.add('active');

      if (!activeCharts[id] && window.chartConfigs && window.chartConfigs[id]) {
        var chart = echarts.init(document.getElementById('dom-' + id), 'dark');
        var cfg = window.chartConfigs[id];
        chart.setOption({
          backgroundColor: 'transparent',
          tooltip: { trigger: 'axis' },
          dataZoom: [{type: 'inside'}, {type: 'slider', bottom: 10}],
          xAxis: { type: 'value', name: 'Offset (ms)', scale: true },
          yAxis: { type: 'category', data: ['Suspend', 'Active'] },
          series: [{
            type: 'line', step: 'end', data: cfg.data,
            lineStyle: { width: 3, color: '#58a6ff' },
            itemStyle: { color: '#58a6ff' },
            markPoint: { data: cfg.marks, symbolSize: 40 }
          }]
        });
        activeCharts[id] = chart;
      } else if (activeCharts[id]) {
        activeCharts[id].resize();
      }
    }

    window.addEventListener('resize', function() {
      Object.values(activeCharts).forEach(chart => chart.resize());
    });
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn line(probe_id: u64, tid: u64, seq: u64, is_active: bool, ts: u64) -> String {
        format!(
            "{{\"probe_id\":{probe_id},\"tid\":{tid},\"addr\":\"0x0000000000000100\",\"seq\":{seq},\"is_active\":{is_active},\"ts\":{ts}}}\n",
        )
    }

    #[test]
    fn test_reconstruct_groups_and_orders() {
        let mut input = String::new();
        input.push_str(&line(2, 1, 1, true, 5_000_000));
        input.push_str(&line(1, 1, 2, false, 3_000_000));
        input.push_str(&line(1, 1, 1, true, 1_000_000));

        let instances = reconstruct(Cursor::new(input)).expect("reconstruct");
        assert_eq!(instances.len(), 2);

        // Sorted by probe id, events sorted by timestamp.
        assert_eq!(instances[0].probe_id, 1);
        assert_eq!(instances[0].points.len(), 2);
        assert_eq!(instances[0].points[0], (0.0, 1));
        assert_eq!(instances[0].points[1], (2.0, 0));
        assert!((instances[0].duration_ms - 2.0).abs() < 1e-9);

        assert_eq!(instances[1].probe_id, 2);
        assert_eq!(instances[1].start_ts, 5_000_000);
    }

    #[test]
    fn test_thread_migrations_marked() {
        let mut input = String::new();
        input.push_str(&line(1, 10, 1, true, 1_000_000));
        input.push_str(&line(1, 10, 2, false, 2_000_000));
        input.push_str(&line(1, 11, 3, true, 3_000_000));

        let instances = reconstruct(Cursor::new(input)).expect("reconstruct");
        assert_eq!(instances[0].thread_count, 2);
        // Initial tid counts as the first migration marker, then 10 -> 11.
        assert_eq!(instances[0].migrations.len(), 2);
        assert_eq!(instances[0].migrations[1].2, 11);
    }

    #[test]
    fn test_corruption_flags() {
        let mut input = String::new();
        input.push_str(&line(0, 1, 1, true, 1_000));
        input.push_str(&line(1, 1, 1, true, 1_000));
        // Instance 2 spans well past the plausibility threshold.
        input.push_str(&line(2, 1, 1, true, 0));
        input.push_str(&line(2, 1, 2, false, 2_000_000_000_000_000));

        let instances = reconstruct(Cursor::new(input)).expect("reconstruct");
        assert!(instances[0].corrupted, "probe id 0 is corrupted");
        assert!(!instances[1].corrupted);
        assert!(instances[2].corrupted, "implausible duration is corrupted");
    }

    #[test]
    fn test_generate_html_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let trace = dir.path().join("trace.jsonl");
        let html = dir.path().join("dashboard.html");

        let mut input = String::new();
        input.push_str(&line(7, 1, 1, true, 1_000_000));
        input.push_str(&line(7, 2, 2, false, 4_000_000));
        input.push_str("garbage line\n");
        std::fs::write(&trace, input).expect("write trace");

        generate_html(&trace, &html).expect("generate");

        let page = std::fs::read_to_string(&html).expect("read dashboard");
        assert!(page.contains("Instance #7"));
        assert!(page.contains("window.chartConfigs['7']"));
        assert!(page.contains("[0.000000,1],[3.000000,0]"));
        assert!(page.contains("TID:2"));
        assert!(page.starts_with("<!DOCTYPE html>"));
    }
}
