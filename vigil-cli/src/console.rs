// Terminal operator interface
// One stdin reader thread feeds both the per-cycle commands and the naming prompt

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vigil_eye::{
    AnnotationSet, BoundingBox, ControlCommand, ControlInput, Frame, Prompter, RecognizerKind, Renderer, SessionStatus,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Start the thread that forwards stdin lines. It ends with stdin.
pub fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = channel::unbounded();
    std::thread::Builder::new()
        .name("vigil-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("stdin closed: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// `q` quit, `s` save, `t` toggle text, `t <name>` toggle a recognizer
pub fn parse_command(line: &str) -> Result<Option<ControlCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(None);
    };

    let command = match head.to_ascii_lowercase().as_str() {
        "q" | "quit" => ControlCommand::Quit,
        "s" | "save" => ControlCommand::SaveFrame,
        "t" | "toggle" => match parts.next() {
            Some(name) => ControlCommand::Toggle(name.parse::<RecognizerKind>()?),
            None => ControlCommand::Toggle(RecognizerKind::Text),
        },
        other => return Err(format!("Unknown command '{}' (q, s, t [faces|objects|text])", other)),
    };
    Ok(Some(command))
}

/// Control input and naming prompt sharing one stdin reader. Commands
/// typed while the prompt waits are handed to the control input.
pub fn console(lines: Receiver<String>, interrupt: Arc<AtomicBool>) -> (ConsoleControl, ConsolePrompter) {
    let (deferred_tx, deferred_rx) = channel::unbounded();
    (
        ConsoleControl {
            lines: lines.clone(),
            deferred: deferred_rx,
        },
        ConsolePrompter {
            lines,
            deferred: deferred_tx,
            interrupt,
        },
    )
}

pub struct ConsoleControl {
    lines: Receiver<String>,
    deferred: Receiver<ControlCommand>,
}

impl ControlInput for ConsoleControl {
    fn poll(&mut self) -> Option<ControlCommand> {
        if let Ok(command) = self.deferred.try_recv() {
            return Some(command);
        }
        loop {
            match self.lines.try_recv() {
                Ok(line) => match parse_command(&line) {
                    Ok(Some(command)) => return Some(command),
                    Ok(None) => continue,
                    Err(e) => warn!("{}", e),
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }
}

/// Reads a name for an unknown face from stdin
pub struct ConsolePrompter {
    lines: Receiver<String>,
    deferred: Sender<ControlCommand>,
    interrupt: Arc<AtomicBool>,
}

impl ConsolePrompter {
    /// Lines typed before the prompt appeared are commands, not names
    fn defer_pending(&self) {
        while let Ok(line) = self.lines.try_recv() {
            match parse_command(&line) {
                Ok(Some(command)) => {
                    debug!("Deferring {:?} until after the prompt", command);
                    if self.deferred.send(command).is_err() {
                        warn!("Control input is gone, dropping {:?}", command);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
    }
}

impl Prompter for ConsolePrompter {
    fn request_label(&mut self, face: &Frame, region: &BoundingBox) -> String {
        self.defer_pending();
        print!(
            "\nUnknown face at ({:.0}, {:.0}), {}x{} px. Enter name (or press Enter to skip): ",
            region.x,
            region.y,
            face.width(),
            face.height()
        );
        let _ = io::stdout().flush();

        loop {
            if self.interrupt.load(Ordering::Relaxed) {
                return String::new();
            }
            match self.lines.recv_timeout(Duration::from_millis(200)) {
                Ok(line) => return line.trim().to_string(),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return String::new(),
            }
        }
    }
}

/// Prints a status line every couple of seconds and logs caption changes
pub struct LogRenderer {
    last_status: Option<Instant>,
    last_captions: BTreeMap<RecognizerKind, Vec<String>>,
}

impl Default for LogRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRenderer {
    pub fn new() -> Self {
        Self {
            last_status: None,
            last_captions: BTreeMap::new(),
        }
    }
}

impl Renderer for LogRenderer {
    fn render(&mut self, _frame: &Frame, annotations: &AnnotationSet, status: &SessionStatus) {
        for kind in RecognizerKind::ALL {
            let captions: Vec<String> = annotations.get(kind).iter().map(|a| a.caption.clone()).collect();
            if self.last_captions.get(&kind) != Some(&captions) {
                if !captions.is_empty() && kind != RecognizerKind::Faces {
                    debug!("{}: {}", kind, captions.join(", "));
                }
                self.last_captions.insert(kind, captions);
            }
        }

        let due = self.last_status.map_or(true, |t| t.elapsed() >= STATUS_INTERVAL);
        if due {
            let active: Vec<&str> = status.active.iter().map(RecognizerKind::name).collect();
            let transport = status.transport.map(|t| format!(" over {}", t)).unwrap_or_default();
            info!(
                "{:.1} fps | cycle {} | {} {}{} | active: {} | {} annotations",
                status.fps,
                status.cycle,
                status.source,
                status.address,
                transport,
                if active.is_empty() { "none".to_string() } else { active.join(", ") },
                annotations.len()
            );
            self.last_status = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("q"), Ok(Some(ControlCommand::Quit)));
        assert_eq!(parse_command(" S "), Ok(Some(ControlCommand::SaveFrame)));
        assert_eq!(parse_command("t"), Ok(Some(ControlCommand::Toggle(RecognizerKind::Text))));
        assert_eq!(parse_command("t faces"), Ok(Some(ControlCommand::Toggle(RecognizerKind::Faces))));
        assert_eq!(parse_command("toggle ocr"), Ok(Some(ControlCommand::Toggle(RecognizerKind::Text))));
        assert_eq!(parse_command(""), Ok(None));
        assert!(parse_command("t cars").is_err());
        assert!(parse_command("x").is_err());
    }

    #[test]
    fn test_console_control_skips_bad_lines() {
        let (tx, rx) = channel::unbounded();
        tx.send("hello".to_string()).unwrap();
        tx.send("".to_string()).unwrap();
        tx.send("q".to_string()).unwrap();

        let (mut control, _prompter) = console(rx, Arc::new(AtomicBool::new(false)));
        assert_eq!(control.poll(), Some(ControlCommand::Quit));
        assert_eq!(control.poll(), None);
    }

    #[test]
    fn test_prompter_returns_next_line_and_stops_on_interrupt() {
        let (tx, rx) = channel::unbounded();
        let interrupt = Arc::new(AtomicBool::new(false));
        let (_control, mut prompter) = console(rx, interrupt.clone());
        let frame = Frame::solid(4, 4, [0, 0, 0]).unwrap();
        let region = BoundingBox::new(1.0, 1.0, 2.0, 2.0);

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send("  Alice ".to_string()).unwrap();
            tx
        });
        assert_eq!(prompter.request_label(&frame, &region), "Alice");
        let _tx = sender.join().unwrap();

        interrupt.store(true, Ordering::Relaxed);
        assert_eq!(prompter.request_label(&frame, &region), "");
    }

    #[test]
    fn test_command_typed_before_prompt_runs_after_it() {
        let (tx, rx) = channel::unbounded();
        let (mut control, mut prompter) = console(rx, Arc::new(AtomicBool::new(false)));
        let face = Frame::solid(4, 4, [0, 0, 0]).unwrap();
        let region = BoundingBox::new(1.0, 1.0, 2.0, 2.0);

        tx.send("q".to_string()).unwrap();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            tx.send("Bob".to_string()).unwrap();
            tx
        });
        assert_eq!(prompter.request_label(&face, &region), "Bob");
        let _tx = sender.join().unwrap();

        assert_eq!(control.poll(), Some(ControlCommand::Quit));
        assert_eq!(control.poll(), None);
    }
}
