// Operator console for the Deshi Knowledge Collector
// Run with: cargo run --bin console
//
// Two-step flow: configure, then manage. The listener runs on a background
// thread; the foreground tails a shared in-memory log buffer every couple of
// seconds while accepting commands.

use std::collections::HashMap;
use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dotenv::dotenv;
use tracing::error;

use deshi_collector::config::{
    self, masked, RuntimeConfig, SLACK_APP_TOKEN, SLACK_BOT_TOKEN, SUPABASE_SERVICE_KEY,
    SUPABASE_TABLE_NAME, SUPABASE_URL, TARGET_SLACK_USER_ID,
};
use deshi_collector::logbuf::LogBuffer;
use deshi_collector::run_collector;

const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

fn main() {
    dotenv().ok();

    // All tracing output from the background listener is teed into the shared
    // buffer; the foreground renders it, so stdout stays free for the console.
    let log_buffer = LogBuffer::new();
    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(log_buffer.clone())
        .init();

    println!("Deshi Knowledge Collector");
    println!("Collects Slack messages from a designated user and stores them in Supabase.");
    println!();

    // One reader thread owns the terminal and touches it only when asked for
    // exactly one answer (a plain line or a masked secret). The form and the
    // command loop both go through it, so there is never more than one pending
    // read on the terminal and a typed secret cannot be picked up by anything
    // but the secret prompt that requested it.
    let input = spawn_terminal_reader();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let mut listener: Option<JoinHandle<()>> = None;
    let mut runtime_config = configure(&input);
    let mut cursor = 0usize;

    print_menu();
    input.request_line();

    loop {
        match input.responses.recv_timeout(REFRESH_INTERVAL) {
            Ok(Ok(line)) => {
                match line.trim() {
                    "" => {}
                    "start" => {
                        if listener_is_active(&listener) {
                            println!("Bot listener is already running.");
                        } else {
                            log_buffer.clear();
                            cursor = 0;
                            stop_flag.store(false, Ordering::SeqCst);
                            listener = Some(spawn_listener(runtime_config.clone()));
                            println!("Bot listener thread started. Logs follow below.");
                        }
                    }
                    "reset" => {
                        // Advisory only: nothing observes this flag once the
                        // listener is handed to the background thread. A
                        // running listener keeps running until the process
                        // exits.
                        stop_flag.store(true, Ordering::SeqCst);
                        if listener_is_active(&listener) {
                            println!(
                                "Reset clears the console configuration only; the running \
                                 listener thread cannot be stopped and keeps running."
                            );
                        }
                        log_buffer.append("Reset requested from console.");
                        runtime_config = configure(&input);
                        print_menu();
                    }
                    "status" => print_status(&runtime_config, listener_is_active(&listener)),
                    "quit" | "exit" => {
                        println!("Exiting. A running listener thread terminates with the process.");
                        return;
                    }
                    other => {
                        println!("Unknown command: {other}");
                        print_menu();
                    }
                }
                input.request_line();
            }
            Ok(Err(_)) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if listener_is_active(&listener) {
                    let (tail, next) = log_buffer.tail_from(cursor);
                    cursor = next;
                    for line in tail {
                        println!("{line}");
                    }
                } else if let Some(handle) = listener.take() {
                    // The listener returned: surface whatever it logged last.
                    let _ = handle.join();
                    let (tail, next) = log_buffer.tail_from(cursor);
                    cursor = next;
                    for line in tail {
                        println!("{line}");
                    }
                    println!("Bot listener thread has stopped. Use 'start' to launch a new one.");
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Step 1: the configuration form. Re-shown until every mandatory field is
/// non-empty; environment values are offered as defaults, secrets are masked.
fn configure(input: &TerminalInput) -> RuntimeConfig {
    loop {
        println!("Step 1: Configure");
        let mut answers: HashMap<&'static str, String> = HashMap::new();
        let fields: [(&'static str, &str, bool); 6] = [
            (SLACK_BOT_TOKEN, "Slack Bot Token (xoxb-)", true),
            (SLACK_APP_TOKEN, "Slack App Token (xapp-)", true),
            (SUPABASE_URL, "Supabase Project URL", false),
            (SUPABASE_SERVICE_KEY, "Supabase Service Role Key", true),
            (
                TARGET_SLACK_USER_ID,
                "Target Slack User ID (e.g., UXXXXXXXXXX)",
                false,
            ),
            (SUPABASE_TABLE_NAME, "Supabase Table Name", false),
        ];

        for (var, label, secret) in fields {
            match prompt_field(input, var, label, secret) {
                Ok(value) => {
                    answers.insert(var, value);
                }
                Err(err) => {
                    println!("Failed to read input: {err}");
                    process::exit(1);
                }
            }
        }

        match RuntimeConfig::from_lookup(|var| answers.get(var).cloned()) {
            Ok(resolved) => {
                println!("Configuration saved. You can now start the bot.");
                println!();
                return resolved;
            }
            Err(err) => {
                println!("{err}. Please fill in all required fields.");
                println!();
            }
        }
    }
}

fn prompt_field(
    input: &TerminalInput,
    var: &'static str,
    label: &str,
    secret: bool,
) -> io::Result<String> {
    let default = env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| {
            if var == SUPABASE_TABLE_NAME {
                config::DEFAULT_TABLE_NAME.to_string()
            } else {
                String::new()
            }
        });

    let hint = if default.is_empty() {
        String::new()
    } else if secret {
        format!(" [{}]", masked(&default))
    } else {
        format!(" [{default}]")
    };

    let answer = if secret {
        input.read_secret(format!("{label}{hint}: "))?
    } else {
        print!("{label}{hint}: ");
        io::stdout().flush()?;
        input.read_line()?
    };

    if answer.trim().is_empty() {
        Ok(default)
    } else {
        Ok(answer)
    }
}

fn print_menu() {
    println!("Step 2: Manage. Commands: start | reset | status | quit");
}

fn print_status(config: &RuntimeConfig, active: bool) {
    println!("Bot listener: {}", if active { "active" } else { "inactive" });
    println!("  SLACK_BOT_TOKEN:      {}", masked(&config.slack_bot_token));
    println!("  SLACK_APP_TOKEN:      {}", masked(&config.slack_app_token));
    println!("  SUPABASE_URL:         {}", config.supabase_url);
    println!(
        "  SUPABASE_SERVICE_KEY: {}",
        masked(&config.supabase_service_key)
    );
    println!("  TARGET_SLACK_USER_ID: {}", config.target_user_id);
    println!("  SUPABASE_TABLE_NAME:  {}", config.table_name);
}

fn listener_is_active(listener: &Option<JoinHandle<()>>) -> bool {
    listener.as_ref().is_some_and(|handle| !handle.is_finished())
}

/// Background unit of execution: a plain thread owning its own tokio runtime,
/// blocking on the listener for the lifetime of the connection.
fn spawn_listener(config: RuntimeConfig) -> JoinHandle<()> {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "Failed to start listener runtime");
                return;
            }
        };
        if let Err(err) = runtime.block_on(run_collector(config)) {
            error!(error = %err, "Listener terminated");
        }
    })
}

/// One terminal answer the foreground is waiting for.
enum InputRequest {
    Line,
    Secret(String),
}

/// Handle to the reader thread that owns the terminal. The thread performs a
/// read only in response to a request, so at most one read is ever pending
/// and plain-line and masked-secret reads can never race for the same input.
struct TerminalInput {
    requests: mpsc::Sender<InputRequest>,
    responses: mpsc::Receiver<io::Result<String>>,
}

impl TerminalInput {
    /// Ask for the next command line without blocking; the answer arrives on
    /// `responses`, which the command loop polls with a timeout.
    fn request_line(&self) {
        let _ = self.requests.send(InputRequest::Line);
    }

    fn read_line(&self) -> io::Result<String> {
        self.request_line();
        self.recv_answer()
    }

    fn read_secret(&self, prompt: String) -> io::Result<String> {
        let _ = self.requests.send(InputRequest::Secret(prompt));
        self.recv_answer()
    }

    fn recv_answer(&self) -> io::Result<String> {
        self.responses
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "input thread stopped"))?
    }
}

fn spawn_terminal_reader() -> TerminalInput {
    spawn_reader_with(
        || {
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed")),
                Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
                Err(err) => Err(err),
            }
        },
        |prompt| rpassword::prompt_password(prompt),
    )
}

fn spawn_reader_with<L, S>(mut read_line: L, mut read_secret: S) -> TerminalInput
where
    L: FnMut() -> io::Result<String> + Send + 'static,
    S: FnMut(String) -> io::Result<String> + Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel::<InputRequest>();
    let (resp_tx, resp_rx) = mpsc::channel();
    thread::spawn(move || {
        while let Ok(request) = req_rx.recv() {
            let answer = match request {
                InputRequest::Line => read_line(),
                InputRequest::Secret(prompt) => read_secret(prompt),
            };
            let failed = answer.is_err();
            if resp_tx.send(answer).is_err() || failed {
                return;
            }
        }
    });
    TerminalInput {
        requests: req_tx,
        responses: resp_rx,
    }
}
