//! Interactive HDQL shell.
//!
//! By default we use `rustyline` for line editing, history and tab
//! completion. A minimal stdin-based fallback exists behind
//! `--no-default-features`.
//!
//! All state lives in an explicit [`ReplSession`]; nothing is process-global,
//! so tests drive sessions directly through [`ReplSession::dispatch`].

use crate::render;
use crate::store::open_store;
use anyhow::{anyhow, Result};
use chrono::Utc;
use colored::Colorize;
use hdql_engine::{QueryEngine, QueryOptions, QueryResult};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ReplControl {
    Continue,
    Exit,
}

const COMMANDS: &[&str] = &[
    "help", "exit", "quit", "query", "parse", "explain", "analyze", "show", "types", "history",
    "examples", "limit", "save", "load",
];

pub struct ReplSession {
    engine: QueryEngine,
    limit: Option<usize>,
    history: Vec<String>,
    history_log: Option<PathBuf>,
}

impl ReplSession {
    pub fn new(engine: QueryEngine, history_log: Option<PathBuf>) -> Self {
        Self {
            engine,
            limit: Some(10),
            history: Vec::new(),
            history_log,
        }
    }

    /// Read earlier entries from the history log. Lines are
    /// `<rfc3339 timestamp>\t<input>`.
    pub fn load_history(&mut self) -> Result<()> {
        let Some(path) = self.history_log.as_ref() else {
            return Ok(());
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(anyhow!("failed to read {}: {e}", path.display())),
        };
        self.history.extend(
            text.lines()
                .filter_map(|l| l.split_once('\t').map(|(_, input)| input.to_string())),
        );
        Ok(())
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn record(&mut self, line: &str) -> Result<()> {
        self.history.push(line.to_string());
        if let Some(path) = self.history_log.as_ref() {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}\t{line}", Utc::now().to_rfc3339())?;
        }
        Ok(())
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            limit: self.limit,
            timeout: None,
        }
    }

    /// Run one input line. Output goes to `out`; errors are returned for the
    /// caller to print.
    pub fn dispatch(&mut self, line: &str, out: &mut dyn Write) -> Result<ReplControl> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(ReplControl::Continue);
        }
        self.record(line)?;

        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match cmd {
            "help" | "?" => {
                write!(out, "{HELP}")?;
            }
            "exit" | "quit" => return Ok(ReplControl::Exit),
            "query" | "q" => self.cmd_query(require_arg(cmd, rest)?, out)?,
            "parse" => {
                let query = self.engine.parse(require_arg(cmd, rest)?)?;
                writeln!(out, "{query}")?;
                writeln!(out, "{query:#?}")?;
            }
            "explain" => {
                let plan = self.engine.explain(require_arg(cmd, rest)?)?;
                write!(out, "{plan}")?;
            }
            "analyze" => {
                let result = self.engine.analyze(require_arg(cmd, rest)?, self.options())?;
                write!(out, "{}", render::text(&QueryResult::Analysis(result)))?;
            }
            "show" => self.cmd_show(require_arg(cmd, rest)?, out)?,
            "types" => self.cmd_types(out)?,
            "history" => {
                for (i, entry) in self.history.iter().enumerate() {
                    writeln!(out, "{:>4}  {entry}", i + 1)?;
                }
            }
            "examples" => self.cmd_examples(out)?,
            "limit" => {
                self.limit = match rest {
                    "" => return Err(anyhow!("usage: limit <n|none>")),
                    "none" | "off" => None,
                    n => Some(
                        n.parse()
                            .map_err(|_| anyhow!("limit expects a number, got `{n}`"))?,
                    ),
                };
                match self.limit {
                    Some(n) => writeln!(out, "limit set to {n}")?,
                    None => writeln!(out, "limit cleared")?,
                }
            }
            "save" => {
                let path = PathBuf::from(require_arg(cmd, rest)?);
                self.engine.store().persist(&path)?;
                writeln!(out, "saved snapshot to {}", path.display())?;
            }
            "load" => {
                let path = PathBuf::from(require_arg(cmd, rest)?);
                self.cmd_load(&path, out)?;
            }
            _ => self.cmd_query(line, out)?,
        }
        Ok(ReplControl::Continue)
    }

    fn cmd_query(&self, text: &str, out: &mut dyn Write) -> Result<()> {
        let result = self.engine.execute(text, self.options())?;
        write!(out, "{}", render::text(&result))?;
        Ok(())
    }

    fn cmd_show(&self, entity_type: &str, out: &mut dyn Write) -> Result<()> {
        let snapshot = self.engine.store().snapshot();
        let resolved = singular_candidates(entity_type)
            .into_iter()
            .find(|t| snapshot.has_type(t))
            .ok_or_else(|| anyhow!("unknown entity type `{entity_type}` (try `types`)"))?;

        let entities = snapshot.list(&resolved);
        let shown = self.limit.unwrap_or(usize::MAX);
        writeln!(out, "{} ({} entities)", resolved.bold(), entities.len())?;
        for (_, entity) in entities.iter().take(shown) {
            let meta: Vec<String> = entity
                .metadata
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            writeln!(
                out,
                "  {:<24} {:<32} {}",
                entity.id.cyan(),
                entity.display_name,
                meta.join(" ").dimmed()
            )?;
        }
        if entities.len() > shown {
            writeln!(out, "  ... {} more (see `limit`)", entities.len() - shown)?;
        }
        Ok(())
    }

    fn cmd_types(&self, out: &mut dyn Write) -> Result<()> {
        let snapshot = self.engine.store().snapshot();
        writeln!(
            out,
            "{} (generation {}, {} entities)",
            "entity types".bold(),
            snapshot.generation(),
            snapshot.len()
        )?;
        for t in snapshot.entity_types() {
            let ann = if snapshot.has_ann(t) { " [hnsw]" } else { "" };
            writeln!(out, "  {t:<24} {:>6}{ann}", snapshot.type_len(t))?;
        }
        let relations: Vec<String> = snapshot.relations().map(|(k, _)| k.to_string()).collect();
        if !relations.is_empty() {
            writeln!(out, "{}", "relations".bold())?;
            for r in relations {
                writeln!(out, "  {r}")?;
            }
        }
        let fields: Vec<&str> = snapshot.fields().collect();
        if !fields.is_empty() {
            writeln!(out, "{} {}", "fields:".bold(), fields.join(", "))?;
        }
        Ok(())
    }

    /// Example queries built from whatever the current snapshot holds.
    fn cmd_examples(&self, out: &mut dyn Write) -> Result<()> {
        let snapshot = self.engine.store().snapshot();
        let Some((entity_type, id)) = snapshot
            .entities()
            .first()
            .map(|e| (e.entity_type.clone(), e.id.clone()))
        else {
            writeln!(out, "the store is empty; `load` an ingestion bundle first")?;
            return Ok(());
        };

        let mut examples = vec![
            format!("{entity_type}(\"{id}\")"),
            format!("{entity_type}(\"*\")"),
            format!("{entity_type}(\"{id}\"~)"),
            format!("similar_to({entity_type}(\"{id}\"), distance=0.3, top_k=5)"),
        ];
        if let Some((key, _)) = snapshot.relations().next() {
            examples.push(format!(
                "{}(\"*\") -[{}]-> {}(\"*\")",
                key.source_type, key.relation, key.target_type
            ));
        }
        let numeric: Vec<&str> = snapshot
            .fields()
            .filter(|f| snapshot.field_stats(f).is_some_and(|s| s.min.is_some()))
            .collect();
        if let [first, second, ..] = numeric.as_slice() {
            let limit = snapshot
                .field_stats(second)
                .and_then(|s| s.max)
                .unwrap_or(10.0);
            examples.push(format!(
                "maximize({first}) subject_to({second} <= {limit})"
            ));
        }
        for example in examples {
            writeln!(out, "  {example}")?;
        }
        Ok(())
    }

    fn cmd_load(&mut self, path: &Path, out: &mut dyn Write) -> Result<()> {
        let config = self.engine.config().clone();
        let store = open_store(Some(path), &config)?;
        self.engine = QueryEngine::new(store, config);
        let snapshot = self.engine.store().snapshot();
        writeln!(
            out,
            "loaded {} entities of {} types from {}",
            snapshot.len(),
            snapshot.entity_types().count(),
            path.display()
        )?;
        Ok(())
    }

    fn completion_words(&self) -> Vec<String> {
        let snapshot = self.engine.store().snapshot();
        let mut words: Vec<String> = COMMANDS.iter().map(|c| c.to_string()).collect();
        words.extend(snapshot.entity_types().map(str::to_string));
        words.extend(snapshot.fields().map(str::to_string));
        words.extend(
            ["similar_to", "maximize", "minimize", "subject_to", "is_to", "AND", "OR", "NOT"]
                .iter()
                .map(|w| w.to_string()),
        );
        words.sort();
        words.dedup();
        words
    }
}

fn require_arg<'a>(cmd: &str, rest: &'a str) -> Result<&'a str> {
    if rest.is_empty() {
        return Err(anyhow!("usage: {cmd} <query>"));
    }
    Ok(rest)
}

/// `features` -> `features`, `feature`; `capabilities` -> `capability`.
fn singular_candidates(name: &str) -> Vec<String> {
    let mut out = vec![name.to_string()];
    if let Some(stem) = name.strip_suffix("ies") {
        out.push(format!("{stem}y"));
    }
    if let Some(stem) = name.strip_suffix("es") {
        out.push(stem.to_string());
    }
    if let Some(stem) = name.strip_suffix('s') {
        out.push(stem.to_string());
    }
    out
}

const HELP: &str = r#"Commands:
  help | ?                 Show this help
  exit | quit              Exit the REPL

  <query>                  Execute a query (same as `query <query>`)
  query <query>            Execute a query
  parse <query>            Print the canonical form and AST
  explain <query>          Print the execution plan with costs and index hints
  analyze <query>          Execute and report coverage gaps and opportunities

  show <type>              List entities of a type (plural forms accepted)
  types                    List entity types, relations and metadata fields
  examples                 Example queries for the loaded store
  history                  Show this session's input history
  limit <n|none>           Set the result limit (default 10)

  save <file>              Persist the current snapshot
  load <file>              Load an ingestion bundle (.json) or snapshot file
"#;

pub fn cmd_repl(engine: QueryEngine, history_log: Option<PathBuf>) -> Result<()> {
    let mut session = ReplSession::new(engine, history_log);
    if let Err(e) = session.load_history() {
        eprintln!("{} {e}", "warning:".yellow().bold());
    }

    #[cfg(feature = "repl-rustyline")]
    {
        return cmd_repl_rustyline(session);
    }
    #[cfg(not(feature = "repl-rustyline"))]
    {
        return cmd_repl_simple(session);
    }
}

fn report(result: Result<ReplControl>) -> ReplControl {
    match result {
        Ok(control) => control,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            if let Some(trace) = e
                .downcast_ref::<hdql_engine::QueryError>()
                .and_then(|q| q.partial_trace())
            {
                let mut text = String::new();
                render::trace_text(&mut text, trace);
                eprint!("{text}");
            }
            ReplControl::Continue
        }
    }
}

#[cfg(not(feature = "repl-rustyline"))]
fn cmd_repl_simple(mut session: ReplSession) -> Result<()> {
    println!("{}", "HDQL REPL".green().bold());
    println!("Type `help` for commands. Type `exit` to quit.\n");

    let stdin = io::stdin();
    loop {
        print!("{}", "hdql> ".cyan().bold());
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let mut stdout = io::stdout();
        if let ReplControl::Exit = report(session.dispatch(&line, &mut stdout)) {
            break;
        }
    }
    Ok(())
}

#[cfg(feature = "repl-rustyline")]
fn cmd_repl_rustyline(mut session: ReplSession) -> Result<()> {
    use rustyline::error::ReadlineError;
    use rustyline::Editor;

    println!("{}", "HDQL REPL".green().bold());
    println!("Tab-completion enabled. Type `help` for commands. Type `exit` to quit.\n");

    let words = std::sync::Arc::new(parking_lot::RwLock::new(session.completion_words()));
    let mut rl: Editor<ReplLineHelper, rustyline::history::DefaultHistory> =
        Editor::new().map_err(|e| anyhow!("failed to init rustyline: {e}"))?;
    rl.set_helper(Some(ReplLineHelper::new(words.clone())));
    for entry in session.history() {
        rl.add_history_entry(entry.as_str())
            .map_err(|e| anyhow!("failed to record history: {e}"))?;
    }

    loop {
        let line = match rl.readline("hdql> ") {
            Ok(l) => l,
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => continue,
            Err(e) => return Err(anyhow!("readline error: {e}")),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        rl.add_history_entry(trimmed)
            .map_err(|e| anyhow!("failed to record history: {e}"))?;

        let mut stdout = io::stdout();
        let control = report(session.dispatch(trimmed, &mut stdout));
        // `load` may change the catalogue.
        *words.write() = session.completion_words();
        if let ReplControl::Exit = control {
            break;
        }
    }
    Ok(())
}

// =============================================================================
// Tab completion (rustyline)
// =============================================================================

#[cfg(feature = "repl-rustyline")]
struct ReplLineHelper {
    files: rustyline::completion::FilenameCompleter,
    words: std::sync::Arc<parking_lot::RwLock<Vec<String>>>,
}

#[cfg(feature = "repl-rustyline")]
impl ReplLineHelper {
    fn new(words: std::sync::Arc<parking_lot::RwLock<Vec<String>>>) -> Self {
        Self {
            files: rustyline::completion::FilenameCompleter::new(),
            words,
        }
    }

    fn pairs_from_prefix(items: &[String], prefix: &str) -> Vec<rustyline::completion::Pair> {
        items
            .iter()
            .filter(|item| item.starts_with(prefix))
            .map(|item| rustyline::completion::Pair {
                display: item.clone(),
                replacement: item.clone(),
            })
            .collect()
    }
}

#[cfg(feature = "repl-rustyline")]
impl rustyline::Helper for ReplLineHelper {}

#[cfg(feature = "repl-rustyline")]
impl rustyline::highlight::Highlighter for ReplLineHelper {}

#[cfg(feature = "repl-rustyline")]
impl rustyline::hint::Hinter for ReplLineHelper {
    type Hint = String;
    fn hint(&self, _line: &str, _pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        None
    }
}

#[cfg(feature = "repl-rustyline")]
impl rustyline::validate::Validator for ReplLineHelper {}

#[cfg(feature = "repl-rustyline")]
impl rustyline::completion::Completer for ReplLineHelper {
    type Candidate = rustyline::completion::Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        let start = line[..pos]
            .rfind(|c: char| !(c.is_alphanumeric() || c == '_'))
            .map(|i| i + 1)
            .unwrap_or(0);
        let word = &line[start..pos];

        if matches!(line.split_whitespace().next(), Some("save" | "load")) && start > 0 {
            return self.files.complete(line, pos, ctx);
        }
        let words = self.words.read();
        Ok((start, Self::pairs_from_prefix(&words, word)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdql_engine::EngineConfig;
    use hdql_store::vector::normalize_in_place;
    use hdql_store::{
        EmbeddingStore, Entity, MetaValue, RelationEmbedding, RelationOperator, StoreConfig,
    };
    use std::sync::Arc;

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let mut v = vec![x, y];
        normalize_in_place(&mut v);
        v
    }

    fn session(history_log: Option<PathBuf>) -> ReplSession {
        colored::control::set_override(false);
        let store = EmbeddingStore::new(StoreConfig::default());
        store
            .load(
                vec![
                    Entity::new("command", "deps", unit(1.0, 0.0))
                        .with_meta("uses", MetaValue::Number(3.0)),
                    Entity::new("command", "build", unit(0.9, 0.1))
                        .with_meta("uses", MetaValue::Number(5.0)),
                ],
                Vec::new(),
            )
            .unwrap();
        ReplSession::new(
            QueryEngine::new(Arc::new(store), EngineConfig::default()),
            history_log,
        )
    }

    fn run(session: &mut ReplSession, line: &str) -> String {
        let mut out = Vec::new();
        session.dispatch(line, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn bare_query_executes() {
        let mut s = session(None);
        let out = run(&mut s, r#"command("deps")"#);
        assert!(out.contains("command(\"deps\")"));
        assert!(out.contains("score 1.000"));
    }

    #[test]
    fn show_accepts_plural() {
        let mut s = session(None);
        let out = run(&mut s, "show commands");
        assert!(out.contains("command (2 entities)"));
        assert!(out.contains("deps"));
    }

    #[test]
    fn limit_and_history_are_per_session() {
        let mut a = session(None);
        let b = session(None);
        run(&mut a, "limit 3");
        assert_eq!(a.limit(), Some(3));
        assert_eq!(b.limit(), Some(10));
        assert_eq!(a.history(), ["limit 3"]);
        assert!(b.history().is_empty());
        assert!(a.dispatch("limit x", &mut io::sink()).is_err());
    }

    #[test]
    fn history_log_is_appended_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("history");
        let mut s = session(Some(log.clone()));
        run(&mut s, "types");
        run(&mut s, r#"explain command("deps")"#);

        let mut reopened = session(Some(log));
        reopened.load_history().unwrap();
        assert_eq!(reopened.history(), ["types", r#"explain command("deps")"#]);
    }

    #[test]
    fn save_and_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.hdqs");
        let mut s = session(None);
        run(&mut s, &format!("save {}", path.display()));
        let mut other = ReplSession::new(
            QueryEngine::new(
                Arc::new(EmbeddingStore::new(StoreConfig::default())),
                EngineConfig::default(),
            ),
            None,
        );
        let out = run(&mut other, &format!("load {}", path.display()));
        assert!(out.contains("loaded 2 entities"));
        // One numeric field and no relations: only the lookup and similarity examples.
        let out = run(&mut other, "examples");
        assert_eq!(
            out.lines().collect::<Vec<_>>(),
            [
                r#"  command("deps")"#,
                r#"  command("*")"#,
                r#"  command("deps"~)"#,
                r#"  similar_to(command("deps"), distance=0.3, top_k=5)"#,
            ]
        );
    }

    #[test]
    fn examples_cover_relations_and_optimization() {
        let store = EmbeddingStore::new(StoreConfig::default());
        store
            .load(
                vec![
                    Entity::new("command", "deps", unit(1.0, 0.0))
                        .with_meta("uses", MetaValue::Number(3.0))
                        .with_meta("effort", MetaValue::Number(4.0)),
                    Entity::new("job", "ship", unit(0.0, 1.0)),
                ],
                vec![RelationEmbedding {
                    source_type: "command".into(),
                    relation: "serves".into(),
                    target_type: "job".into(),
                    operator: RelationOperator::Offset(vec![0.0, 0.0]),
                }],
            )
            .unwrap();
        let mut s = ReplSession::new(
            QueryEngine::new(Arc::new(store), EngineConfig::default()),
            None,
        );
        let out = run(&mut s, "examples");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[4], r#"  command("*") -[serves]-> job("*")"#);
        assert!(lines[5].starts_with("  maximize("));
        assert!(lines[5].contains("subject_to("));
        for line in &lines {
            assert!(hdql_dsl::parse_query(line.trim()).is_ok(), "{line}");
        }
    }

    #[test]
    fn errors_surface_and_exit_stops() {
        let mut s = session(None);
        let err = s.dispatch(r#"widget("x")"#, &mut io::sink()).unwrap_err();
        assert!(err.to_string().contains("widget"));
        assert!(matches!(
            s.dispatch("exit", &mut io::sink()).unwrap(),
            ReplControl::Exit
        ));
    }
}
