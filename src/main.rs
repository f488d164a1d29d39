//! Terminal driver for the session engine.
//!
//! ```text
//! session-engine [--voice] [--provider <id>] [--pcm <file>]
//! ```
//!
//! Lines typed on stdin are sent as user messages (text sessions). Commands:
//! `/start`, `/switch <provider>`, `/mute`, `/unmute`, `/finish`, `/cancel`,
//! `/end`, `/consent grant|deny`, `/providers`, `/metrics`, `/quit`.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use session_engine::providers::{
    BufferedAudioOutput, ChannelAudioInput, ProviderRegistry, TEXT_DEFAULT, VOICE_A,
};
use session_engine::{
    credentials, load_settings, Modality, Phase, Role, SessionEngine, SessionError,
    SessionObserver,
};
use tokio::io::{AsyncBufReadExt, BufReader};

struct Args {
    modality: Modality,
    provider: Option<String>,
    pcm: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        modality: Modality::Text,
        provider: None,
        pcm: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--voice" => args.modality = Modality::Voice,
            "--text" => args.modality = Modality::Text,
            "--provider" => {
                args.provider = Some(iter.next().ok_or("--provider needs a value")?);
            }
            "--pcm" => {
                args.pcm = Some(iter.next().ok_or("--pcm needs a file")?.into());
            }
            "-h" | "--help" => {
                return Err(
                    "usage: session-engine [--voice] [--provider <id>] [--pcm <file>]".to_string(),
                )
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    let settings = load_settings();
    let token = credentials::auth_token();
    match &token {
        Some(token) => log::info!("Using backend token {}", credentials::masked_token(token)),
        None => eprintln!("[warn] no backend token ({} or keyring)", credentials::ENV_TOKEN),
    }

    let input = ChannelAudioInput::new();
    let providers = ProviderRegistry::with_defaults(
        &settings,
        token,
        Arc::new(input.clone()),
        Arc::new(BufferedAudioOutput::new()),
    );
    let input_rate = settings.input_sample_rate;
    let engine = SessionEngine::builder()
        .settings(settings)
        .providers(providers)
        .build();

    if let Some(path) = args.pcm.clone() {
        tokio::spawn(feed_pcm(path, input, input_rate));
    }

    let provider = args.provider.clone().unwrap_or_else(|| {
        match args.modality {
            Modality::Text => TEXT_DEFAULT,
            Modality::Voice => VOICE_A,
        }
        .to_string()
    });

    tokio::spawn(print_updates(engine.observer()));
    start(&engine, args.modality, &provider).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("[error] stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        let result = match (parts.next().unwrap_or_default(), parts.next().map(str::trim)) {
            ("/quit", _) => break,
            ("/start", _) => {
                start(&engine, args.modality, &provider).await;
                Ok(())
            }
            ("/switch", Some(id)) => engine.switch_provider(id).await,
            ("/switch", None) => {
                eprintln!("usage: /switch <provider>");
                Ok(())
            }
            ("/mute", _) => engine.mute().await,
            ("/unmute", _) => engine.unmute().await,
            ("/cancel", _) => engine.cancel().await,
            ("/end", _) => engine.end().await,
            ("/finish", _) => match engine.finish().await {
                Ok(summary) => {
                    println!("\n[summary] {} turns", summary.turn_count);
                    for point in &summary.key_points {
                        println!("  - {}", point);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ("/consent", Some(choice)) => {
                let result = match choice {
                    "grant" => engine.consent().grant(),
                    "deny" => engine.consent().deny(),
                    _ => {
                        eprintln!("usage: /consent grant|deny");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    eprintln!("[error] could not save consent: {}", e);
                }
                println!("[consent] {}", engine.consent().status());
                Ok(())
            }
            ("/providers", _) => {
                for id in engine.provider_ids() {
                    println!("  {}", id);
                }
                Ok(())
            }
            ("/metrics", _) => {
                let summary = engine.metrics().await;
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("[error] {}", e),
                }
                Ok(())
            }
            (command, _) if command.starts_with('/') => {
                eprintln!("unknown command: {}", command);
                Ok(())
            }
            _ => engine.send(line).await,
        };

        if let Err(e) = result {
            report(&e);
        }
    }

    engine.shutdown().await;
    ExitCode::SUCCESS
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn report(e: &SessionError) {
    if e.is_busy() {
        eprintln!("[busy] {}", e);
    } else {
        eprintln!("[error] {}", e);
    }
}

async fn start(engine: &SessionEngine, modality: Modality, provider: &str) {
    match engine.start(modality, provider).await {
        Ok(observer) => {
            let snapshot = observer.current();
            println!("[session] {} via {} ({})", modality, provider, snapshot.state);
        }
        Err(SessionError::ConsentRequired { .. }) => {
            println!("[consent] required: type `/consent grant`, then `/start`");
        }
        Err(e) => report(&e),
    }
}

/// Stream assistant text as it arrives and announce state changes.
async fn print_updates(mut observer: SessionObserver) {
    let mut last_phase = observer.current().state;
    let mut printed: (usize, usize) = (usize::MAX, 0);

    while let Some(snapshot) = observer.changed().await {
        if let Some((index, turn)) = snapshot.transcript.iter().enumerate().last() {
            if turn.role == Role::Assistant {
                if printed.0 != index {
                    printed = (index, 0);
                    print!("\nassistant: ");
                }
                if let Some(rest) = turn.content.get(printed.1..) {
                    print!("{}", rest);
                    printed.1 = turn.content.len();
                }
                if !turn.streaming && snapshot.state == Phase::Listening {
                    println!();
                }
                let _ = std::io::stdout().flush();
            } else if printed.0 != index && snapshot.state == Phase::Processing {
                printed = (index, turn.content.len());
                if snapshot.session.as_ref().map(|s| s.modality) == Some(Modality::Voice) {
                    println!("\nyou: {}", turn.content);
                }
            }
        }

        if snapshot.state != last_phase {
            if let (Phase::Error, Some(fault)) = (snapshot.state, &snapshot.error) {
                eprintln!("\n[error] {} ({})", fault.message, fault.detail);
            } else {
                log::info!("Session state: {}", snapshot.state);
            }
            last_phase = snapshot.state;
        }
    }
}

/// Play a raw PCM16 LE mono file into the microphone input, in real time.
async fn feed_pcm(path: PathBuf, input: ChannelAudioInput, sample_rate: u32) {
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("[error] could not read {:?}: {}", path, e);
            return;
        }
    };
    let samples = session_engine::streaming::pcm16_from_bytes(&bytes);
    let frame = (sample_rate / 100).max(1) as usize;
    log::info!("Feeding {} samples from {:?}", samples.len(), path);

    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    for chunk in samples.chunks(frame) {
        ticker.tick().await;
        input.push(chunk.to_vec());
    }
    log::info!("Finished feeding {:?}", path);
}
