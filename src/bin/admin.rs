// author: kodeholic (powered by Claude)
//
// tvadmin: televisit-signal 운영 관리 CLI
//
// 사용법:
//   tvadmin [--host HOST] [--port PORT] <COMMAND>
//
// 조회 명령
//   tvadmin status                         서버 상태 요약 (uptime, 세션 수, 구독 수)
//   tvadmin sessions                       세션 전체 테이블
//   tvadmin sessions <room_id> <call_id>   세션 상세 (offer/answer, candidate 목록)
//
// 조작 명령
//   tvadmin purge <room_id> <call_id>      세션 강제 삭제

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use tabled::{Table, Tabled};

// ----------------------------------------------------------------------------
// [CLI 정의]
// ----------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name    = "tvadmin",
    about   = "televisit-signal 운영 관리 CLI",
    version,
)]
struct Cli {
    /// 서버 호스트
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 서버 포트 (WS/HTTP 공용)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 서버 상태 요약
    Status,

    /// 세션 목록 또는 상세
    Sessions {
        /// room_id + call_id 지정 시 상세 보기
        room_id: Option<String>,
        #[arg(requires = "room_id")]
        call_id: Option<String>,
    },

    /// 세션 강제 삭제 (참여자는 RemoteEnded 로 종료)
    Purge {
        room_id: String,
        call_id: String,
    },
}

// ----------------------------------------------------------------------------
// [응답 타입]: http/dto.rs 와 대응
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct ServerStatus {
    uptime_secs:    u64,
    session_count:  usize,
    answered_count: usize,
    watcher_count:  usize,
    #[serde(default)]
    trace_clients:  usize,
}

#[derive(Deserialize, Tabled)]
struct AdminSessionSummary {
    #[tabled(rename = "ROOM")]
    room_id:             String,
    #[tabled(rename = "CALL")]
    call_id:             String,
    #[tabled(rename = "OFFERER")]
    initiator_id:        String,
    #[tabled(rename = "ANSWERER")]
    #[serde(deserialize_with = "deser_opt_string")]
    answerer_id:         String,
    #[tabled(rename = "STATE")]
    state:               String,
    #[tabled(rename = "AGE(s)")]
    age_secs:            u64,
    #[tabled(rename = "CAND O")]
    offerer_candidates:  usize,
    #[tabled(rename = "CAND A")]
    answerer_candidates: usize,
    #[tabled(rename = "WATCH")]
    watchers:            usize,
}

#[derive(Deserialize)]
struct AdminSessionDetail {
    room_id:             String,
    call_id:             String,
    initiator_id:        String,
    answerer_id:         Option<String>,
    nonce:               String,
    created_at:          u64,
    age_secs:            u64,
    state:               String,
    offer:               Option<Description>,
    answer:              Option<Description>,
    offerer_candidates:  Vec<CandidateRow>,
    answerer_candidates: Vec<CandidateRow>,
    watchers:            usize,
}

#[derive(Deserialize)]
struct Description {
    sdp: String,
}

#[derive(Deserialize, Tabled)]
struct CandidateRow {
    #[tabled(rename = "CANDIDATE")]
    candidate: String,
    #[tabled(rename = "MID")]
    #[serde(rename = "sdpMid", default, deserialize_with = "deser_opt_string")]
    sdp_mid:   String,
}

// ----------------------------------------------------------------------------
// [main]
// ----------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    let base = format!("http://{}:{}", cli.host, cli.port);

    let result = match &cli.command {
        Command::Status => cmd_status(&base),
        Command::Sessions { room_id: Some(rid), call_id: Some(cid) } => cmd_session_detail(&base, rid, cid),
        Command::Sessions { room_id: Some(rid), call_id: None }      => cmd_sessions(&base, Some(rid.as_str())),
        Command::Sessions { .. }                                     => cmd_sessions(&base, None),
        Command::Purge { room_id, call_id } => cmd_purge(&base, room_id, call_id),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "ERROR:".red().bold(), e);
        std::process::exit(1);
    }
}

// ----------------------------------------------------------------------------
// [커맨드 구현]
// ----------------------------------------------------------------------------

fn cmd_status(base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let s: ServerStatus = get_json(&format!("{}/admin/status", base))?;

    let hours   = s.uptime_secs / 3600;
    let minutes = (s.uptime_secs % 3600) / 60;
    let secs    = s.uptime_secs % 60;

    println!();
    println!("{}", "  televisit-signal Server Status".bold().cyan());
    println!("  {}", "─".repeat(36).dimmed());
    println!("  {:16} {}",
        "Uptime:".bold(),
        format!("{}h {}m {}s", hours, minutes, secs).green()
    );
    println!("  {:16} {}", "Sessions:".bold(), s.session_count.to_string().yellow());
    println!("  {:16} {}", "Answered:".bold(), s.answered_count.to_string().green());
    println!("  {:16} {}", "Watchers:".bold(), s.watcher_count.to_string().yellow());
    println!("  {:16} {}", "Trace clients:".bold(), s.trace_clients.to_string().dimmed());
    println!();
    Ok(())
}

/// room_id 지정 시 해당 병원 세션만
fn cmd_sessions(base: &str, room_id: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut sessions: Vec<AdminSessionSummary> = get_json(&format!("{}/admin/sessions", base))?;
    if let Some(rid) = room_id {
        sessions.retain(|s| s.room_id == rid);
    }

    if sessions.is_empty() {
        println!("{}", "  진행 중인 세션 없음".dimmed());
        return Ok(());
    }

    // 상태별 컬러
    for s in &mut sessions {
        s.state = match s.state.as_str() {
            "answered" => s.state.green().to_string(),
            "offered"  => s.state.yellow().to_string(),
            _          => s.state.dimmed().to_string(),
        };
    }

    println!();
    println!("{}", Table::new(&sessions));
    println!("  {} session(s)", sessions.len());
    println!();
    Ok(())
}

fn cmd_session_detail(base: &str, room_id: &str, call_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let s: AdminSessionDetail = get_json(&format!("{}/admin/sessions/{}/{}", base, room_id, call_id))?;

    println!();
    println!("{}", format!("  Session: {}/{}", s.room_id, s.call_id).bold().cyan());
    println!("  {}", "─".repeat(48).dimmed());
    println!("  {:16} {}", "State:".bold(),    s.state.yellow());
    println!("  {:16} {}", "Offerer:".bold(),  s.initiator_id);
    println!("  {:16} {}", "Answerer:".bold(), s.answerer_id.as_deref().unwrap_or("(대기 중)").dimmed());
    println!("  {:16} {}", "Nonce:".bold(),    s.nonce.dimmed());
    println!("  {:16} {} ({}s 경과)", "Created:".bold(), format_ts(s.created_at), s.age_secs);
    println!("  {:16} {}", "Watchers:".bold(), s.watchers);
    println!("  {:16} {}", "Offer:".bold(),    describe_sdp(s.offer.as_ref()));
    println!("  {:16} {}", "Answer:".bold(),   describe_sdp(s.answer.as_ref()));

    print_candidates("Offerer Candidates", &s.offerer_candidates);
    print_candidates("Answerer Candidates", &s.answerer_candidates);

    println!();
    Ok(())
}

fn cmd_purge(base: &str, room_id: &str, call_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::blocking::Client::new();
    let url    = format!("{}/admin/purge/{}/{}", base, room_id, call_id);
    let resp   = client.post(&url).send()?;

    let status = resp.status();
    let body: serde_json::Value = resp.json()?;

    if status.is_success() {
        println!();
        println!("  {} room={} call={}",
            "Purge OK".green().bold(),
            room_id.yellow(),
            call_id.cyan(),
        );
        println!();
    } else {
        let msg = body["error"].as_str().unwrap_or("unknown error");
        return Err(format!("[{}] {}", status, msg).into());
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// [공통 유틸]
// ----------------------------------------------------------------------------

fn print_candidates(title: &str, rows: &[CandidateRow]) {
    if rows.is_empty() {
        return;
    }
    println!();
    println!("{} ({})", format!("  {}", title).bold(), rows.len());
    println!("{}", Table::new(rows).to_string()
        .lines()
        .map(|l| format!("  {}", l))
        .collect::<Vec<_>>()
        .join("\n"));
}

/// SDP 는 길어서 첫 줄 + 길이만
fn describe_sdp(desc: Option<&Description>) -> String {
    match desc {
        Some(d) => {
            let first = d.sdp.lines().next().unwrap_or("");
            format!("{} ({} bytes)", first, d.sdp.len())
        }
        None => "-".dimmed().to_string(),
    }
}

/// Option<String> JSON → String ("-" 폴백)
fn deser_opt_string<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v: Option<String> = serde::Deserialize::deserialize(d)?;
    Ok(v.unwrap_or_else(|| "-".to_string()))
}

/// GET 요청 + JSON 역직렬화
fn get_json<T: for<'de> serde::Deserialize<'de>>(url: &str) -> Result<T, Box<dyn std::error::Error>> {
    let resp = reqwest::blocking::get(url)?;
    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let msg = body["error"].as_str().unwrap_or("unknown error");
        return Err(format!("[{}] {}", status, msg).into());
    }
    Ok(resp.json()?)
}

/// Unix millis → "YYYY-MM-DD HH:MM:SS" (로컬 시간)
fn format_ts(ms: u64) -> String {
    if ms == 0 { return "-".to_string(); }
    match Local.timestamp_millis_opt(ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None     => "-".to_string(),
    }
}
