//! CleanerML rule loading.
//!
//! A rule file describes, per browser, which paths and registry entries make
//! up each cleaning option. Only the subset of elements needed to build
//! [`CleaningOption`]s is understood; everything else is ignored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::platform::Platform;
use super::types::{CleaningAction, CleaningOption, ScriptHost, ScriptSpec, SearchType};
use crate::error::{CleanerError, Result};

/// Upper bound on `$$var$$` combinations produced for a single path.
pub const MAX_VAR_EXPANSIONS: usize = 4096;

const DELETE_COMMANDS: &[&str] = &["delete", "chrome.history", "chrome.favicons", "json"];

pub fn load_rule_file(path: &Path, platform: &Platform) -> Result<Vec<CleaningOption>> {
    let xml = fs::read_to_string(path).map_err(|e| CleanerError::RuleParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let options = parse_rules(&xml, platform).map_err(|e| match e {
        CleanerError::RuleParse { message, .. } => CleanerError::RuleParse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;
    info!(
        "Loaded {} cleaning options from {}",
        options.len(),
        path.display()
    );
    Ok(options)
}

/// Loads every file, skipping (and logging) the ones that fail to parse.
pub fn load_rule_files<I, P>(paths: I, platform: &Platform) -> Vec<CleaningOption>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut options = Vec::new();
    for path in paths {
        match load_rule_file(path.as_ref(), platform) {
            Ok(loaded) => options.extend(loaded),
            Err(e) => error!("Skipping rule file: {}", e),
        }
    }
    options
}

pub fn parse_rules(xml: &str, platform: &Platform) -> Result<Vec<CleaningOption>> {
    let document = parse_document(xml).map_err(|message| CleanerError::RuleParse {
        path: PathBuf::from("<inline>"),
        message,
    })?;

    let cleaner = match document.descendants("cleaner").into_iter().next() {
        Some(c) => c,
        None => return Ok(Vec::new()),
    };
    if !platform.matches(cleaner.attr("os")) {
        debug!("Rule file not meant for {:?}", platform);
        return Ok(Vec::new());
    }

    let vars = collect_vars(cleaner, platform);

    let mut options = Vec::new();
    for option in cleaner.descendants("option") {
        let id = option.attr("id").to_string();
        let label = option
            .first_text("label")
            .unwrap_or_else(|| id.clone());
        let description = option.first_text("description").unwrap_or_default();
        let warning = option.first_text("warning");

        let mut actions = Vec::new();
        for action in option.descendants("action") {
            if !platform.matches(action.attr("os")) {
                continue;
            }
            build_actions(action, &vars, &mut actions);
        }

        if actions.is_empty() {
            debug!("Option '{}' has no actions for this platform", id);
            continue;
        }
        options.push(CleaningOption {
            id,
            label,
            description,
            warning,
            actions,
        });
    }
    Ok(options)
}

fn collect_vars(cleaner: &Element, platform: &Platform) -> Vec<(String, Vec<String>)> {
    let mut vars: Vec<(String, Vec<String>)> = Vec::new();
    for var in cleaner.descendants("var") {
        let name = var.attr("name").to_string();
        let values: Vec<String> = var
            .descendants("value")
            .into_iter()
            .filter(|v| platform.matches(v.attr("os")))
            .map(|v| v.text())
            .filter(|s| !s.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }
        match vars.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = values,
            None => vars.push((name, values)),
        }
    }
    vars
}

fn build_actions(action: &Element, vars: &[(String, Vec<String>)], out: &mut Vec<CleaningAction>) {
    let command = action.attr("command");
    if DELETE_COMMANDS.contains(&command) {
        let search = match action.attr("search") {
            "" => SearchType::File,
            raw => match raw.parse::<SearchType>() {
                Ok(s) => s,
                Err(e) => {
                    debug!("Skipping action: {}", e);
                    return;
                }
            },
        };
        let raw_path = action.attr("path");
        if raw_path.is_empty() {
            return;
        }
        for path in VarExpansion::new(raw_path, vars) {
            out.push(CleaningAction::Delete { search, path });
        }
        return;
    }

    match command {
        "winreg" => {
            let raw_key = action.attr("path");
            if raw_key.is_empty() {
                return;
            }
            let value = action.attr("name");
            for key in VarExpansion::new(raw_key, vars) {
                if value.is_empty() {
                    out.push(CleaningAction::RegistryDeleteKey { key });
                } else {
                    out.push(CleaningAction::RegistryDeleteValue {
                        key,
                        value: value.to_string(),
                    });
                }
            }
        }
        "script" => match action.attr("host").parse::<ScriptHost>() {
            Ok(host) => {
                let code = action.text();
                if !code.is_empty() {
                    out.push(CleaningAction::ExternalScript(ScriptSpec { host, code }));
                }
            }
            Err(e) => debug!("Skipping script action: {}", e),
        },
        other => debug!("Skipping unsupported command '{}'", other),
    }
}

/// Lazy cartesian substitution of `$$name$$` tokens.
///
/// Only variables whose token appears in the template take part. The first
/// variable varies slowest. Iteration stops after [`MAX_VAR_EXPANSIONS`]
/// items; `restart` rewinds to the first combination.
#[derive(Debug, Clone)]
pub struct VarExpansion<'a> {
    template: &'a str,
    slots: Vec<(String, &'a [String])>,
    indices: Vec<usize>,
    emitted: usize,
    done: bool,
}

impl<'a> VarExpansion<'a> {
    pub fn new(template: &'a str, vars: &'a [(String, Vec<String>)]) -> Self {
        let slots = if template.contains("$$") {
            vars.iter()
                .map(|(name, values)| (format!("$${}$$", name), values.as_slice()))
                .filter(|(token, values)| template.contains(token.as_str()) && !values.is_empty())
                .collect()
        } else {
            Vec::new()
        };
        let indices = vec![0; slots.len()];
        let expansion = VarExpansion {
            template,
            slots,
            indices,
            emitted: 0,
            done: false,
        };
        if expansion.total() > MAX_VAR_EXPANSIONS {
            warn!(
                "Path '{}' expands to {} combinations, keeping the first {}",
                template,
                expansion.total(),
                MAX_VAR_EXPANSIONS
            );
        }
        expansion
    }

    /// Number of combinations before the cap is applied.
    pub fn total(&self) -> usize {
        self.slots
            .iter()
            .fold(1usize, |acc, (_, values)| acc.saturating_mul(values.len()))
    }

    pub fn restart(&mut self) {
        self.indices.iter_mut().for_each(|i| *i = 0);
        self.emitted = 0;
        self.done = false;
    }

    fn current(&self) -> String {
        let mut out = self.template.to_string();
        for ((token, values), &idx) in self.slots.iter().zip(&self.indices) {
            out = out.replace(token.as_str(), &values[idx]);
        }
        out
    }

    fn advance(&mut self) {
        for pos in (0..self.slots.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < self.slots[pos].1.len() {
                return;
            }
            self.indices[pos] = 0;
        }
        self.done = true;
    }
}

impl Iterator for VarExpansion<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done || self.emitted >= MAX_VAR_EXPANSIONS {
            return None;
        }
        let item = self.current();
        self.emitted += 1;
        self.advance();
        Some(item)
    }
}

// -------- Minimal element tree --------

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: HashMap<String, String>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, name: &str) -> &str {
        self.attrs.get(name).map(String::as_str).unwrap_or("")
    }

    /// Direct text children, concatenated and trimmed.
    fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let Node::Text(t) = child {
                out.push_str(t);
            }
        }
        out.trim().to_string()
    }

    /// Every descendant element with this name, in document order.
    fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if let Node::Element(el) = child {
                if el.name == name {
                    found.push(el);
                }
                el.collect_descendants(name, found);
            }
        }
    }

    fn first_text(&self, name: &str) -> Option<String> {
        self.descendants(name).first().map(|el| el.text())
    }
}

fn parse_document(xml: &str) -> std::result::Result<Element, String> {
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![Element::default()];

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
        match event {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let el = open_element(&start)?;
                push_child(&mut stack, Node::Element(el))?;
            }
            Event::End(_) => {
                if stack.len() < 2 {
                    return Err("unbalanced closing tag".to_string());
                }
                if let Some(el) = stack.pop() {
                    push_child(&mut stack, Node::Element(el))?;
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| e.to_string())?;
                push_child(&mut stack, Node::Text(text.into_owned()))?;
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                push_child(&mut stack, Node::Text(text))?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err("unexpected end of document".to_string());
    }
    stack.pop().ok_or_else(|| "empty document".to_string())
}

fn open_element(start: &BytesStart<'_>) -> std::result::Result<Element, String> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        attrs.insert(key, value.into_owned());
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn push_child(stack: &mut [Element], node: Node) -> std::result::Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => Err("content outside of document".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<cleaner id="sample" os="">
  <var name="profile">
    <value os="linux">~/.config/sample</value>
    <value os="windows">%LocalAppData%\Sample</value>
    <value os="darwin">~/Library/Application Support/Sample</value>
  </var>
  <var name="empty">
    <value os="windows"></value>
  </var>
  <option id="cache">
    <label>Cache</label>
    <description>Delete the web cache</description>
    <action command="delete" search="walk.files" path="$$profile$$/Cache"/>
    <action command="delete" search="walk.sideways" path="$$profile$$/Nope"/>
  </option>
  <option id="cookies">
    <description>Delete cookies &amp; site data</description>
    <warning>You will be logged out</warning>
    <action command="delete" path="$$profile$$/Cookies"/>
    <action command="chrome.history" search="file" path="$$profile$$/History"/>
    <action command="sqlite.vacuum" search="file" path="$$profile$$/History"/>
  </option>
  <option id="windows_only">
    <label>Registry</label>
    <action command="winreg" os="windows" path="HKCU\Software\Sample\Recent"/>
    <action command="winreg" os="windows" path="HKCU\Software\Sample" name="LastUrl"/>
    <action command="script" os="windows" host="powershell">Remove-Item $env:TEMP\sample*</action>
  </option>
</cleaner>
"#;

    #[test]
    fn parses_options_for_linux() {
        let options = parse_rules(SAMPLE, &Platform::Linux).unwrap();
        let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["cache", "cookies"]);

        let cache = &options[0];
        assert_eq!(cache.label, "Cache");
        assert_eq!(
            cache.actions,
            vec![CleaningAction::delete(
                SearchType::WalkFiles,
                "~/.config/sample/Cache"
            )]
        );

        let cookies = &options[1];
        assert_eq!(cookies.label, "cookies");
        assert_eq!(cookies.description, "Delete cookies & site data");
        assert_eq!(cookies.warning.as_deref(), Some("You will be logged out"));
        assert_eq!(cookies.actions.len(), 2);
        assert_eq!(cookies.actions[0].search_type(), Some(SearchType::File));
    }

    #[test]
    fn windows_gets_registry_and_script_actions() {
        let options = parse_rules(SAMPLE, &Platform::Windows).unwrap();
        let registry = options.iter().find(|o| o.id == "windows_only").unwrap();
        assert_eq!(
            registry.actions,
            vec![
                CleaningAction::RegistryDeleteKey {
                    key: r"HKCU\Software\Sample\Recent".into()
                },
                CleaningAction::RegistryDeleteValue {
                    key: r"HKCU\Software\Sample".into(),
                    value: "LastUrl".into()
                },
                CleaningAction::ExternalScript(ScriptSpec {
                    host: ScriptHost::PowerShell,
                    code: r"Remove-Item $env:TEMP\sample*".into()
                }),
            ]
        );
    }

    #[test]
    fn cleaner_os_mismatch_yields_nothing() {
        let xml = r#"<cleaner id="x" os="windows">
            <option id="a"><action command="delete" path="C:\x"/></option>
        </cleaner>"#;
        assert!(parse_rules(xml, &Platform::Darwin).unwrap().is_empty());
        assert_eq!(parse_rules(xml, &Platform::Windows).unwrap().len(), 1);
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_rules("<cleaner><option id='a'></cleaner>", &Platform::Linux).unwrap_err();
        assert!(matches!(err, CleanerError::RuleParse { .. }));
    }

    #[test]
    fn missing_cleaner_root_is_empty() {
        assert!(parse_rules("<other/>", &Platform::Linux).unwrap().is_empty());
    }

    #[test]
    fn bad_sibling_file_does_not_block_others() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good.xml");
        let bad = temp.path().join("bad.xml");
        let missing = temp.path().join("missing.xml");
        fs::write(&good, SAMPLE).unwrap();
        fs::write(&bad, "<cleaner><option").unwrap();

        let options = load_rule_files([&bad, &good, &missing], &Platform::Linux);
        assert_eq!(options.len(), 2);

        match load_rule_file(&bad, &Platform::Linux) {
            Err(CleanerError::RuleParse { path, .. }) => assert_eq!(path, bad),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn expansion_is_cartesian_and_restartable() {
        let vars = vec![
            ("a".to_string(), vec!["1".to_string(), "2".to_string()]),
            ("b".to_string(), vec!["x".to_string(), "y".to_string(), "z".to_string()]),
            ("unused".to_string(), vec!["q".to_string()]),
        ];
        let mut exp = VarExpansion::new("$$a$$/$$b$$/$$missing$$", &vars);
        assert_eq!(exp.total(), 6);
        let first: Vec<String> = exp.by_ref().collect();
        assert_eq!(
            first,
            vec![
                "1/x/$$missing$$",
                "1/y/$$missing$$",
                "1/z/$$missing$$",
                "2/x/$$missing$$",
                "2/y/$$missing$$",
                "2/z/$$missing$$"
            ]
        );
        exp.restart();
        assert_eq!(exp.count(), 6);
    }

    #[test]
    fn expansion_without_tokens_yields_template_once() {
        let vars = vec![("a".to_string(), vec!["1".to_string()])];
        let items: Vec<String> = VarExpansion::new("/plain/path", &vars).collect();
        assert_eq!(items, vec!["/plain/path"]);
    }

    #[test]
    fn expansion_is_capped() {
        let values: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        let vars = vec![
            ("a".to_string(), values.clone()),
            ("b".to_string(), values.clone()),
            ("c".to_string(), values),
        ];
        let exp = VarExpansion::new("$$a$$-$$b$$-$$c$$", &vars);
        assert_eq!(exp.total(), 1_000_000);
        assert_eq!(exp.count(), MAX_VAR_EXPANSIONS);
    }

    #[test]
    fn bundled_rule_files_parse() {
        let bundled = [
            include_str!("../../cleaners/google_chrome.xml"),
            include_str!("../../cleaners/microsoft_edge.xml"),
            include_str!("../../cleaners/firefox.xml"),
            include_str!("../../cleaners/brave.xml"),
            include_str!("../../cleaners/opera.xml"),
            include_str!("../../cleaners/whale.xml"),
            include_str!("../../cleaners/safari.xml"),
        ];
        for xml in bundled {
            for platform in [Platform::Windows, Platform::Linux, Platform::Darwin] {
                parse_rules(xml, &platform).unwrap();
            }
        }
        let chrome = parse_rules(bundled[0], &Platform::Linux).unwrap();
        for id in ["cookies", "history", "session", "passwords", "form_history"] {
            assert!(chrome.iter().any(|o| o.id == id), "chrome lacks {}", id);
        }
    }
}
