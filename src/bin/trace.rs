// author: kodeholic (powered by Claude)
//
// tvtrace: 릴레이의 /trace SSE 를 받아 한 줄씩 출력
//
//   tvtrace                       전체
//   tvtrace H01                   병원 하나
//   tvtrace H01 APT1              진료 하나
//   tvtrace H01 -f candidate      op_name 부분 일치 필터 (대소문자 무관)

use chrono::{Local, TimeZone};
use clap::Parser;
use colored::Colorize;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::io::{BufRead, BufReader};

#[derive(Parser)]
#[command(name = "tvtrace", about = "televisit-signal 시그널링 이벤트 관찰", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// op_name 부분 일치 (예: claim, offer, candidate)
    #[arg(long, short = 'f')]
    filter: Option<String>,

    room_id: Option<String>,

    #[arg(requires = "room_id")]
    call_id: Option<String>,
}

impl Cli {
    fn url(&self) -> String {
        let mut url = format!("http://{}:{}/trace", self.host, self.port);
        for segment in [&self.room_id, &self.call_id].into_iter().flatten() {
            url.push('/');
            url.push_str(segment);
        }
        url
    }
}

#[derive(Debug, Deserialize)]
struct TraceEvent {
    ts:      u64,
    dir:     String,
    room_id: Option<String>,
    call_id: Option<String>,
    user_id: Option<String>,
    op:      u8,
    op_name: String,
    summary: String,
}

const RULE: usize = 100;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let url = cli.url();
    let filter = cli.filter.as_deref().map(str::to_lowercase);

    let resp = open_stream(&url)?;
    print_header(&url, filter.as_deref());

    let mut shown: u64 = 0;
    for line in BufReader::new(resp).lines() {
        let line = line.map_err(|e| format!("스트림 읽기 실패: {}", e))?;
        // keep-alive 주석과 빈 줄은 건너뜀
        let Some(payload) = line.strip_prefix("data: ") else { continue };

        let event: TraceEvent = match serde_json::from_str(payload) {
            Ok(e)  => e,
            Err(e) => {
                eprintln!("{} 해석 불가 이벤트: {} ({})", "⚠".yellow(), e, payload);
                continue;
            }
        };
        if filter.as_deref().is_some_and(|f| !event.op_name.to_lowercase().contains(f)) {
            continue;
        }

        print_event(&event);
        shown += 1;
    }

    println!("{}", "─".repeat(RULE).dimmed());
    println!("  스트림 종료 ({} 이벤트)", shown);
    Ok(())
}

fn open_stream(url: &str) -> Result<Response, String> {
    let client = Client::builder()
        .timeout(None)
        .build()
        .map_err(|e| format!("HTTP 클라이언트 생성 실패: {}", e))?;

    let resp = client
        .get(url)
        .header("Accept", "text/event-stream")
        .send()
        .map_err(|e| format!("{} 연결 실패: {}", url, e))?;

    if !resp.status().is_success() {
        return Err(format!("{} → HTTP {}", url, resp.status()));
    }
    Ok(resp)
}

fn print_header(url: &str, filter: Option<&str>) {
    let rule = "─".repeat(RULE);
    println!("{}", rule.dimmed());
    match filter {
        Some(f) => println!("  {} {}  {}", "tvtrace".bold().cyan(), url.dimmed(), format!("[{}]", f).yellow()),
        None    => println!("  {} {}", "tvtrace".bold().cyan(), url.dimmed()),
    }
    println!(
        "  {:<12} {:<5} {:>3} {:<18} {:<12} {:<16} {}",
        "TIME", "DIR", "OP", "OP_NAME", "USER", "SESSION", "SUMMARY",
    );
    println!("{}", rule.dimmed());
}

fn print_event(e: &TraceEvent) {
    let dir = match e.dir.as_str() {
        "in"  => "C→S  ".bright_blue(),
        "out" => "S→C  ".bright_green(),
        "sys" => "SYS  ".bright_yellow(),
        other => fit(other, 5).dimmed(),
    };
    let session = match (&e.room_id, &e.call_id) {
        (Some(room), Some(call)) => format!("{}/{}", room, call),
        (Some(room), None)       => room.clone(),
        _                        => "-".to_string(),
    };

    println!(
        "  {} {} {} {} {} {} {}",
        fit(&format_ts(e.ts), 12).dimmed(),
        dir,
        format!("{:>3}", e.op).dimmed(),
        paint_op(&fit(&e.op_name, 18)),
        fit(e.user_id.as_deref().unwrap_or("-"), 12).bright_white(),
        fit(&session, 16).dimmed(),
        e.summary,
    );
}

/// 세션 수명에 영향을 주는 op 일수록 눈에 띄게
fn paint_op(name: &str) -> String {
    let upper = name.to_uppercase();
    let painted = if upper.contains("ERROR") {
        name.bright_red().bold()
    } else if ["PURGE", "REAP", "DELETE", "ABANDON"].iter().any(|k| upper.contains(k)) {
        name.bright_red()
    } else if upper.contains("CLAIM") {
        name.bright_yellow().bold()
    } else if upper.contains("OFFER") || upper.contains("ANSWER") {
        name.bright_green()
    } else if upper.contains("CANDIDATE") {
        name.bright_cyan()
    } else {
        name.normal()
    };
    painted.to_string()
}

fn format_ts(ts_ms: u64) -> String {
    Local.timestamp_millis_opt(ts_ms as i64)
        .single()
        .map(|dt| dt.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

/// 고정 폭 칸 맞춤. 넘치면 문자 단위로 자르고 … 표시
fn fit(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return format!("{:<width$}", s, width = width);
    }
    let head: String = s.chars().take(width.saturating_sub(1)).collect();
    format!("{}…", head)
}
