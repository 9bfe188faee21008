//! Markdown reporting shared by the attention benches.

use std::{fs, io, path::PathBuf};

const RESULTS_PATH: &str = "crates/attention/benchmarks/RESULTS.md";

/// One markdown table that replaces its own marked section in `RESULTS.md`.
pub struct Report {
    section: &'static str,
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Report {
    pub fn new(section: &'static str, headers: &[&'static str]) -> Self {
        Self {
            section,
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.rows
            .push(cells.into_iter().map(|cell| cell.to_string()).collect());
    }

    pub fn render(&self) -> String {
        let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));
        let headers: Vec<String> = self.headers.iter().map(|h| h.to_string()).collect();
        let rule: Vec<String> = self.headers.iter().map(|_| "---".to_string()).collect();
        let mut table = line(&headers) + &line(&rule);
        for row in &self.rows {
            table.push_str(&line(row));
        }
        table
    }

    /// Prints the table and rewrites the `<!-- SECTION_START/END -->` block.
    pub fn publish(&self) -> io::Result<()> {
        let table = self.render();
        println!("\n{}:\n{table}", self.section);

        let tag = self.section.to_uppercase().replace(' ', "_");
        let (open, close) = (format!("<!-- {tag}_START -->"), format!("<!-- {tag}_END -->"));
        let block = format!("{open}\n{table}{close}\n");

        let path = PathBuf::from(RESULTS_PATH);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = fs::read_to_string(&path)
            .unwrap_or_else(|_| "# CPU attention and cache benchmarks\n\n".to_string());
        match (body.find(&open), body.find(&close)) {
            (Some(start), Some(end)) if start < end => {
                let mut stop = end + close.len();
                if body[stop..].starts_with('\n') {
                    stop += 1;
                }
                body.replace_range(start..stop, &block);
            }
            _ => {
                if !body.ends_with('\n') {
                    body.push('\n');
                }
                body.push_str(&block);
            }
        }
        fs::write(&path, body)
    }
}
