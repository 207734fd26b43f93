use crate::engine::RunReport;
use std::fmt::Write;

const TOP_STATUS_CODES: usize = 10;
const TOP_ERRORS: usize = 5;
const WIDTH: usize = 50;

/// Entries ordered by count descending, ties broken by key ascending, capped at `limit`
pub fn top_n<'a, K: Ord, I>(entries: I, limit: usize) -> Vec<(&'a K, u64)>
where
    I: IntoIterator<Item = (&'a K, &'a u64)>,
    K: 'a,
{
    let mut ranked: Vec<(&K, u64)> = entries.into_iter().map(|(k, v)| (k, *v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(limit);
    ranked
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

pub fn render_summary(report: &RunReport) -> String {
    let s = &report.snapshot;
    let mut out = String::new();
    let rule = "=".repeat(WIDTH);

    // Writing into a String cannot fail
    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "{:^width$}", "Load Test Results", width = WIDTH);
    let _ = writeln!(out, "{}", rule);

    let _ = writeln!(out, "\nTarget:            {}", report.target.base_url);
    let _ = writeln!(
        out,
        "Duration:          {:.2}s{}",
        s.elapsed.as_secs_f64(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    let _ = writeln!(
        out,
        "Protocols:         {} ({})",
        report.protocols,
        if report.probed { "detected" } else { "override" }
    );

    if report.attack.is_active() {
        let _ = writeln!(out, "\nStream reset ({}):", report.attack.as_str());
        let _ = writeln!(out, "  Connections:     {:>12}", s.attack_connections);
        let _ = writeln!(out, "  Conn. errors:    {:>12}", s.attack_connection_errors);
        let _ = writeln!(out, "  Streams sent:    {:>12}", s.attack_streams_sent);
        let _ = writeln!(out, "  Streams recv:    {:>12}", s.attack_streams_received);
        let _ = writeln!(out, "  Streams errored: {:>12}", s.attack_streams_errored);
        if !s.attack_status_codes.is_empty() {
            let _ = writeln!(out, "\nStream Status Codes:");
            for (code, count) in top_n(&s.attack_status_codes, TOP_STATUS_CODES) {
                let _ = writeln!(out, "  {:<16} {:>12}", code, count);
            }
        }
        let _ = writeln!(out, "\n{}", rule);
        return out;
    }

    let _ = writeln!(out, "\nResults:");
    let _ = writeln!(out, "  Total Requests:  {:>12}", s.total_requests);
    let _ = writeln!(out, "  Successful:      {:>12}", s.successful);
    let _ = writeln!(out, "  Failed:          {:>12}", s.failed);
    let _ = writeln!(out, "  Success Rate:    {:>11.2}%", s.success_rate);
    let _ = writeln!(out, "  Requests/sec:    {:>12.2}", s.requests_per_sec);

    let _ = writeln!(out, "\nLatency (ms):");
    let _ = writeln!(out, "  Min:             {:>12.2}", ms(s.latency_min_us));
    let _ = writeln!(out, "  Avg:             {:>12.2}", s.latency_mean_ms());
    let _ = writeln!(out, "  Max:             {:>12.2}", ms(s.latency_max_us));
    let _ = writeln!(out, "  p50:             {:>12.2}", ms(s.latency_p50_us));
    let _ = writeln!(out, "  p95:             {:>12.2}", ms(s.latency_p95_us));
    let _ = writeln!(out, "  p99:             {:>12.2}", ms(s.latency_p99_us));

    let _ = writeln!(out, "\nCircuit Breaker:");
    let _ = writeln!(out, "  Final State:     {:>12}", s.circuit_state.as_str());
    let _ = writeln!(out, "  Trips:           {:>12}", s.circuit_trips);
    let _ = writeln!(out, "  Failure Count:   {:>12}", s.circuit_failures);

    if !s.status_codes.is_empty() {
        let _ = writeln!(out, "\nStatus Codes:");
        for (code, count) in top_n(&s.status_codes, TOP_STATUS_CODES) {
            let _ = writeln!(out, "  {:<16} {:>12}", code, count);
        }
    }

    let protocol_total: u64 = s.protocol_counts.values().sum();
    if protocol_total > 0 {
        let _ = writeln!(out, "\nProtocol Distribution:");
        for (protocol, count) in top_n(&s.protocol_counts, s.protocol_counts.len()) {
            let _ = writeln!(
                out,
                "  {:<16} {:>12}  ({:.1}%)",
                protocol.as_str(),
                count,
                percent(count, protocol_total)
            );
        }
    }

    if !s.errors.is_empty() {
        let _ = writeln!(out, "\nErrors:");
        for (signature, count) in top_n(&s.errors, TOP_ERRORS) {
            let _ = writeln!(out, "  {:<32} {:>12}", signature, count);
        }
    }

    let _ = writeln!(out, "\n{}", rule);
    out
}

pub fn print_summary(report: &RunReport) {
    print!("{}", render_summary(report));
}
