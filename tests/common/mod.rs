#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use report_ingest::schema::{FieldType, SchemaField, TableSchema};
use report_ingest::warehouse::{
    CancelToken, JobId, JobState, LoadJobConfig, LocalWarehouse, MergeStatement, TableInfo,
    TableRef, Warehouse, WarehouseError, WriteDisposition,
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes UTF-8 `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    /// Writes `contents` encoded as Shift_JIS.
    pub fn write_shift_jis(&self, name: &str, contents: &str) -> PathBuf {
        let (encoded, _, had_errors) = encoding_rs::SHIFT_JIS.encode(contents);
        assert!(!had_errors, "fixture not representable in Shift_JIS");
        self.write_bytes(name, &encoded)
    }
}

pub const CV_HEADER: &str = "応募ID,CV名,CV時間,接触回数";

/// A conversion report with `rows` rows and keys `1..=rows`.
pub fn cv_report(rows: usize) -> String {
    cv_report_with(rows, "初回")
}

pub fn cv_report_with(rows: usize, label: &str) -> String {
    let mut text = format!("{CV_HEADER}\n");
    for i in 1..=rows {
        text.push_str(&format!(
            "{i},{label}{i},2025/3/{} 10:{:02},\"{}\"\n",
            (i % 28) + 1,
            i % 60,
            format_thousands(i * 1000)
        ));
    }
    text
}

fn format_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::new();
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn cv_schema() -> TableSchema {
    TableSchema::new(vec![
        SchemaField::new("応募ID", FieldType::Integer).required(),
        SchemaField::new("CV名", FieldType::Text),
        SchemaField::new("CV時間", FieldType::Timestamp),
        SchemaField::new("接触回数", FieldType::Integer),
    ])
}

pub fn destination() -> TableRef {
    TableRef::new("proj", "marketing", "cv_report")
}

/// Wraps the local engine and injects failures, stalls and cancellation by load call number (1-based).
pub struct ScriptedWarehouse {
    pub inner: LocalWarehouse,
    pub loads: Vec<(TableRef, WriteDisposition)>,
    pub merges: usize,
    pub fail_loads: Vec<usize>,
    pub stall_loads: Vec<usize>,
    pub cancel_on_merge: Option<CancelToken>,
    /// MERGE jobs stay `Running` and are never applied.
    pub stall_merges: bool,
    injected: HashMap<JobId, JobState>,
}

impl ScriptedWarehouse {
    pub fn new(inner: LocalWarehouse) -> Self {
        Self {
            inner,
            loads: Vec::new(),
            merges: 0,
            fail_loads: Vec::new(),
            stall_loads: Vec::new(),
            cancel_on_merge: None,
            stall_merges: false,
            injected: HashMap::new(),
        }
    }

    pub fn dispositions(&self) -> Vec<WriteDisposition> {
        self.loads.iter().map(|(_, d)| *d).collect()
    }
}

impl Warehouse for ScriptedWarehouse {
    fn get_table(&self, table: &TableRef) -> Result<Option<TableInfo>, WarehouseError> {
        self.inner.get_table(table)
    }

    fn create_table(&mut self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        self.inner.create_table(table, schema)
    }

    fn delete_table(&mut self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.inner.delete_table(table)
    }

    fn submit_load(
        &mut self,
        config: &LoadJobConfig,
        source: &mut dyn Read,
    ) -> Result<JobId, WarehouseError> {
        self.loads
            .push((config.destination.clone(), config.disposition));
        let call = self.loads.len();
        if self.fail_loads.contains(&call) {
            let job = JobId::new(format!("failed_{call}"));
            self.injected
                .insert(job.clone(), JobState::Failed("injected load failure".into()));
            return Ok(job);
        }
        if self.stall_loads.contains(&call) {
            let job = JobId::new(format!("stalled_{call}"));
            self.injected.insert(job.clone(), JobState::Running);
            return Ok(job);
        }
        self.inner.submit_load(config, source)
    }

    fn submit_merge(&mut self, statement: &MergeStatement) -> Result<JobId, WarehouseError> {
        self.merges += 1;
        if let Some(token) = &self.cancel_on_merge {
            token.cancel();
        }
        if self.stall_merges {
            let job = JobId::new(format!("stalled_merge_{}", self.merges));
            self.injected.insert(job.clone(), JobState::Running);
            return Ok(job);
        }
        self.inner.submit_merge(statement)
    }

    fn job_state(&mut self, job: &JobId) -> Result<JobState, WarehouseError> {
        match self.injected.get(job) {
            Some(state) => Ok(state.clone()),
            None => self.inner.job_state(job),
        }
    }
}
