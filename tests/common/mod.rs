#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use posbackup::backup::BackupService;
use posbackup::data::{DataSource, FieldValue, Record};
use posbackup::errors::{BackupError, Result};
use posbackup::storage::{ObjectInfo, StorageProvider};

/// In-memory provider whose timestamps can be moved for retention tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (Bytes, DateTime<Utc>)>>,
    fail_puts_containing: Mutex<Option<String>>,
    fail_deletes_containing: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_aged(&self, key: &str, data: &[u8], age: Duration) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (Bytes::copy_from_slice(data), Utc::now() - age));
    }

    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.objects.lock().unwrap().get_mut(key) {
            entry.1 = at;
        }
    }

    pub fn fail_puts_containing(&self, needle: &str) {
        *self.fail_puts_containing.lock().unwrap() = Some(needle.to_string());
    }

    pub fn fail_deletes_containing(&self, needle: &str) {
        *self.fail_deletes_containing.lock().unwrap() = Some(needle.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone())
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if let Some(needle) = self.fail_puts_containing.lock().unwrap().as_deref() {
            if key.contains(needle) {
                return Err(BackupError::upload(key, "injected failure"));
            }
        }
        self.objects.lock().unwrap().insert(key.to_string(), (data, Utc::now()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.raw(key).ok_or_else(|| BackupError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (b, at))| ObjectInfo {
                key: k.clone(),
                size: b.len() as u64,
                last_modified: *at,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if let Some(needle) = self.fail_deletes_containing.lock().unwrap().as_deref() {
            if key.contains(needle) {
                return Err(BackupError::delete(key, "injected failure"));
            }
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Canned rows with switches for injecting failures.
#[derive(Default)]
pub struct FakeDataSource {
    pub sales: Vec<Record>,
    pub items: Vec<Record>,
    pub inventory: Vec<Record>,
    pub fail_sales: AtomicBool,
    pub fail_inventory: AtomicBool,
    pub panic_inventory: AtomicBool,
    pub calls: AtomicUsize,
    pub delay_ms: u64,
}

impl FakeDataSource {
    pub fn with_rows(sales: usize, inventory: usize) -> Self {
        FakeDataSource {
            sales: sale_rows(sales),
            items: item_rows(sales),
            inventory: product_rows(inventory),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for FakeDataSource {
    async fn fetch_sales(&self, _start: Option<DateTime<Utc>>, _end: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_sales.load(Ordering::SeqCst) {
            return Err(BackupError::query("sales", "relation \"sales\" does not exist"));
        }
        Ok(self.sales.clone())
    }

    async fn fetch_sale_items(&self, _start: Option<DateTime<Utc>>, _end: Option<DateTime<Utc>>) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }

    async fn fetch_inventory(&self) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_inventory.load(Ordering::SeqCst) {
            panic!("inventory reader exploded");
        }
        if self.fail_inventory.load(Ordering::SeqCst) {
            return Err(BackupError::query("products", "connection refused"));
        }
        Ok(self.inventory.clone())
    }
}

pub fn sale_rows(n: usize) -> Vec<Record> {
    let base = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let mut r = Record::new();
            r.insert("id".into(), FieldValue::Int(i as i64 + 1));
            r.insert("total".into(), FieldValue::Decimal(format!("{}.50", 10 + i)));
            r.insert("payment_method".into(), FieldValue::Text("card".into()));
            r.insert("created_at".into(), FieldValue::Timestamp(base + Duration::minutes(i as i64)));
            r
        })
        .collect()
}

pub fn item_rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let mut r = Record::new();
            r.insert("id".into(), FieldValue::Int(i as i64 + 1));
            r.insert("sale_id".into(), FieldValue::Int(i as i64 + 1));
            r.insert("quantity".into(), FieldValue::Int(2));
            r
        })
        .collect()
}

pub fn product_rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let mut r = Record::new();
            r.insert("id".into(), FieldValue::Int(i as i64 + 1));
            r.insert("name".into(), FieldValue::Text(format!("product-{}", i)));
            r.insert("stock".into(), FieldValue::Int(100 - i as i64));
            r.insert("discontinued".into(), FieldValue::Bool(i % 7 == 0));
            r
        })
        .collect()
}

pub fn service(storage: Arc<MemoryStorage>, data: Arc<FakeDataSource>) -> BackupService {
    BackupService::new(storage, data)
}
