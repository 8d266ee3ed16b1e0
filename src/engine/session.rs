use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::engine::process::{Line, ProcessHandle, StderrMode};
use crate::engine::uci::{parse_bestmove, parse_id, parse_info, SearchSummary};
use crate::engine::{EngineConfig, EngineError, StreamKind};

/// Engines may do slow one-time initialization (loading networks, allocating
/// hash), so the handshake and readiness probes get a long deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// After a lost-on-time move the engine is told to stop; this is how long it
/// gets to produce the dangling `bestmove` before we give up on resyncing.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Spawned,
    Ready,
    InGame,
    Thinking,
    Quitting,
    Gone,
}

/// What one `go` exchange produced: the move, the optional ponder move, the
/// last search info seen before `bestmove`, and the measured think time.
#[derive(Debug, Clone)]
#[must_use]
pub struct MoveResponse {
    pub best_move: String,
    pub ponder: Option<String>,
    pub info: SearchSummary,
    /// The unparsed `info` lines of this exchange, for debug output.
    pub raw_info: Vec<String>,
    pub elapsed: Duration,
}

/// Translates the high-level match protocol into line traffic over a
/// [`ProcessHandle`]. All operations are synchronous with deadlines; the
/// session state machine rejects out-of-order requests.
#[derive(Debug)]
pub struct EngineSession {
    handle: ProcessHandle,
    config: Arc<EngineConfig>,
    state: SessionState,
    pub id_name: Option<String>,
    pub id_author: Option<String>,
    /// Scratch buffer reused between reads.
    lines: Vec<Line>,
}

impl EngineSession {
    /// Spawns the engine process. The handshake is a separate step so a slow
    /// engine failing to come up can be told apart from a failed spawn.
    pub fn spawn(config: Arc<EngineConfig>) -> Result<Self, EngineError> {
        let stderr = match &config.stderr_file {
            Some(path) => StderrMode::ToFile(path.clone()),
            None if log::log_enabled!(log::Level::Debug) => StderrMode::Pipe,
            None => StderrMode::Discard,
        };
        let handle = ProcessHandle::spawn(
            config.dir.as_deref(),
            &config.cmd,
            &config.args,
            &config.name,
            stderr,
        )?;
        Ok(EngineSession {
            handle,
            config,
            state: SessionState::Spawned,
            id_name: None,
            id_author: None,
            lines: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn alive(&mut self) -> bool {
        self.handle.alive()
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// The writable end of the interrupt channel; signalling it wakes any
    /// wait this session is blocked in.
    pub fn interrupt_handle(&self) -> Sender<()> {
        self.handle.interrupt_handle()
    }

    /// Performs the `uci` handshake, applies the configured options in order
    /// and waits for readiness.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.expect(&[SessionState::Spawned], "start")?;
        if let Some(init) = self.config.init_string.clone() {
            self.handle.write_input(&init)?;
        }
        self.handle.write_input("uci")?;
        self.read_until("uciok", HANDSHAKE_TIMEOUT)?;
        for line in &self.lines {
            if line.stream != StreamKind::Stdout {
                continue;
            }
            match parse_id(&line.text) {
                Some(("name", value)) => self.id_name = Some(value),
                Some(("author", value)) => self.id_author = Some(value),
                // option declarations and banners are not interpreted
                _ => {}
            }
        }
        let options = self.config.options.clone();
        for (name, value) in &options {
            self.handle.write_input(&format!("setoption name {name} value {value}"))?;
        }
        self.state = SessionState::Ready;
        self.is_ready(HANDSHAKE_TIMEOUT)
    }

    /// Signals the start of a new game. The caller follows up with
    /// [`Self::is_ready`] before the first move, per the protocol.
    pub fn new_game(&mut self) -> Result<(), EngineError> {
        self.expect(&[SessionState::Ready, SessionState::InGame], "new_game")?;
        self.handle.write_input("ucinewgame")?;
        self.state = SessionState::InGame;
        Ok(())
    }

    pub fn is_ready(&mut self, deadline: Duration) -> Result<(), EngineError> {
        self.expect(&[SessionState::Ready, SessionState::InGame], "is_ready")?;
        self.handle.write_input("isready")?;
        self.read_until("readyok", deadline)
    }

    /// One full move exchange: send the position and go commands, read until
    /// `bestmove` or the deadline. The returned info is from the last `info`
    /// line before `bestmove`; lines that fit no schema are logged and
    /// ignored, only `bestmove` completes the exchange.
    pub fn go(
        &mut self,
        position_cmd: &str,
        go_cmd: &str,
        deadline: Duration,
    ) -> Result<MoveResponse, EngineError> {
        self.expect(&[SessionState::InGame], "go")?;
        self.handle.write_input(position_cmd)?;
        self.handle.write_input(go_cmd)?;
        self.state = SessionState::Thinking;
        let start = Instant::now();
        self.lines.clear();
        let read = self.handle.read_output(&mut self.lines, Some("bestmove"), Some(deadline));
        let elapsed = start.elapsed();
        match read {
            Ok(()) => {
                self.state = SessionState::InGame;
                let (info, raw_info, best) = self.digest_search_output()?;
                let best = best.ok_or_else(|| {
                    EngineError::Protocol("the search ended without a bestmove line".to_string())
                })?;
                Ok(MoveResponse { best_move: best.mov, ponder: best.ponder, info, raw_info, elapsed })
            }
            Err(EngineError::Timeout) => {
                // overdue engines still owe a bestmove; try to resync so a
                // restart-less engine stays usable for the next game
                self.state = SessionState::InGame;
                _ = self.stop();
                Err(EngineError::Timeout)
            }
            Err(err) => {
                self.state = if err.is_disconnect() { SessionState::Gone } else { SessionState::InGame };
                Err(err)
            }
        }
    }

    /// Asks the engine to cut its search short. The dangling `bestmove` is
    /// awaited (briefly) and discarded.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.expect(&[SessionState::InGame, SessionState::Thinking], "stop")?;
        self.handle.write_input("stop")?;
        let grace = STOP_GRACE.saturating_add(self.config.limit.timemargin);
        self.lines.clear();
        match self.handle.read_output(&mut self.lines, Some("bestmove"), Some(grace)) {
            Ok(()) => Ok(()),
            Err(EngineError::Timeout) => {
                warn!("engine '{}' never answered 'stop' with a bestmove", self.name());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Tells a pondering engine that the pondered-on move was played.
    pub fn ponder_hit(&mut self) -> Result<(), EngineError> {
        self.expect(&[SessionState::InGame, SessionState::Thinking], "ponderhit")?;
        self.handle.write_input("ponderhit")
    }

    /// Polite shutdown: `quit`, then the handle's termination protocol
    /// (grace period, kill, reap). Idempotent.
    pub fn quit(&mut self) {
        if matches!(self.state, SessionState::Gone) {
            return;
        }
        self.state = SessionState::Quitting;
        _ = self.handle.write_input("quit");
        self.handle.terminate();
        self.state = SessionState::Gone;
    }

    fn digest_search_output(
        &mut self,
    ) -> Result<(SearchSummary, Vec<String>, Option<crate::engine::uci::BestMove>), EngineError> {
        let mut summary = SearchSummary::default();
        let mut raw_info = vec![];
        let mut best = None;
        for line in &self.lines {
            if line.stream != StreamKind::Stdout || line.partial {
                continue;
            }
            if line.text.starts_with("info") {
                raw_info.push(line.text.clone());
                match parse_info(&line.text, &mut summary) {
                    Ok(Some(msg)) => debug!("engine '{}' says: {msg}", self.config.name),
                    Ok(None) => {}
                    Err(err) => debug!("ignoring malformed info line from '{}': {err}", self.config.name),
                }
            } else if line.text.starts_with("bestmove") {
                best = Some(parse_bestmove(&line.text).map_err(|err| EngineError::Protocol(err.to_string()))?);
            }
            // anything else is logged by the process layer and ignored
        }
        Ok((summary, raw_info, best))
    }

    fn read_until(&mut self, sentinel: &str, deadline: Duration) -> Result<(), EngineError> {
        self.lines.clear();
        self.handle.read_output(&mut self.lines, Some(sentinel), Some(deadline))
    }

    fn expect(&self, allowed: &[SessionState], op: &str) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::Protocol(format!(
                "'{op}' is not a valid request in session state {:?}",
                self.state
            )))
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.quit();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A minimal scripted UCI engine running under /bin/sh, in the spirit of
    /// the mock movers real tournament managers test against.
    pub fn scripted_engine(name: &str, go_response: &str) -> Arc<EngineConfig> {
        let script = format!(
            r#"while read line; do
  case "$line" in
    ucinewgame) ;;
    uci*) echo "id name {name}"; echo "id author test"; echo "uciok";;
    isready) echo "readyok";;
    go*) {go_response};;
    quit) exit 0;;
  esac
done"#
        );
        let mut config = EngineConfig::new(name, "sh");
        config.args = vec!["-c".to_string(), script];
        Arc::new(config)
    }

    #[test]
    fn handshake_and_move_exchange() {
        let config = scripted_engine(
            "mock",
            r#"echo "info depth 3 score cp 25 nodes 123 pv e2e4"; echo "bestmove e2e4 ponder e7e5""#,
        );
        let mut session = EngineSession::spawn(config).unwrap();
        session.start().unwrap();
        assert_eq!(session.id_name.as_deref(), Some("mock"));
        assert_eq!(session.state(), SessionState::Ready);

        session.new_game().unwrap();
        session.is_ready(Duration::from_secs(5)).unwrap();
        let response = session
            .go("position startpos", "go movetime 100", Duration::from_secs(5))
            .unwrap();
        assert_eq!(response.best_move, "e2e4");
        assert_eq!(response.ponder.as_deref(), Some("e7e5"));
        assert_eq!(response.info.depth, 3);
        assert_eq!(response.info.score, Some(crate::score::Score::Cp(25)));
        session.quit();
        assert_eq!(session.state(), SessionState::Gone);
    }

    #[test]
    fn go_times_out_on_a_sleeping_engine() {
        let config = scripted_engine("sleeper", r#"sleep 5; echo "bestmove e2e4""#);
        let mut session = EngineSession::spawn(config).unwrap();
        session.start().unwrap();
        session.new_game().unwrap();
        let err = session
            .go("position startpos", "go movetime 10", Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
        session.quit();
    }

    #[test]
    fn requests_in_the_wrong_state_are_protocol_errors() {
        let config = scripted_engine("strict", r#"echo "bestmove e2e4""#);
        let mut session = EngineSession::spawn(config).unwrap();
        // go before the handshake
        let err = session
            .go("position startpos", "go movetime 1", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        // new_game before the handshake
        assert!(matches!(session.new_game(), Err(EngineError::Protocol(_))));
        session.start().unwrap();
        session.quit();
    }

    #[test]
    fn options_are_applied_in_order() {
        // the mock writes every setoption line it receives back as info strings
        let script = r#"while read line; do
  case "$line" in
    uci*) echo "uciok";;
    setoption*) echo "info string got $line";;
    isready) echo "readyok";;
    quit) exit 0;;
  esac
done"#;
        let mut config = EngineConfig::new("opts", "sh");
        config.args = vec!["-c".to_string(), script.to_string()];
        config.options = vec![
            ("Hash".to_string(), "16".to_string()),
            ("Threads".to_string(), "1".to_string()),
        ];
        let mut session = EngineSession::spawn(Arc::new(config)).unwrap();
        session.start().unwrap();
        let echoed: Vec<&str> = session
            .lines
            .iter()
            .filter_map(|l| l.text.strip_prefix("info string got "))
            .collect();
        assert_eq!(
            echoed,
            vec!["setoption name Hash value 16", "setoption name Threads value 1"]
        );
        session.quit();
    }

    #[test]
    fn a_crashing_engine_reports_a_disconnect() {
        let config = scripted_engine("crasher", "exit 3");
        let mut session = EngineSession::spawn(config).unwrap();
        session.start().unwrap();
        session.new_game().unwrap();
        let err = session
            .go("position startpos", "go movetime 10", Duration::from_secs(5))
            .unwrap_err();
        assert!(err.is_disconnect());
        session.quit();
    }
}
