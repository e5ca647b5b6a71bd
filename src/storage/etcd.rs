// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::{not_found, Key, MetaStore, Operation, Precondition, Transaction, Value};
use crate::error::{CoordError, CoordResult};

/// Column-family emulation by key prefixing: `"<cf>/<key>"`.
fn encode_key(cf: &str, key: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(cf.len() + 1 + key.len());
    encoded.extend_from_slice(cf.as_bytes());
    encoded.push(b'/');
    encoded.extend_from_slice(key);
    encoded
}

/// `etcd`-backed [`MetaStore`]. Transient errors are retried with bounded
/// exponential backoff; once retries are exhausted the error is surfaced to
/// the caller as `CoordError::MetaStore`.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Client,
}

impl EtcdMetaStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(endpoints: Vec<String>) -> CoordResult<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(CoordError::meta_store)?;
        Ok(Self::new(client))
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(5)
    }
}

#[async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get_cf(&self, cf: &str, key: &[u8]) -> CoordResult<Value> {
        let encoded = encode_key(cf, key);
        let mut client = self.client.clone();
        let resp = Retry::spawn(Self::retry_strategy(), || {
            let mut client = client.clone();
            let encoded = encoded.clone();
            async move { client.get(encoded, None).await }
        })
        .await
        .map_err(CoordError::meta_store)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| not_found(cf, key))
    }

    async fn list_cf(&self, cf: &str) -> CoordResult<Vec<(Key, Value)>> {
        let prefix = encode_key(cf, &[]);
        let mut client = self.client.clone();
        let resp = Retry::spawn(Self::retry_strategy(), || {
            let mut client = client.clone();
            let prefix = prefix.clone();
            async move {
                client
                    .get(prefix, Some(GetOptions::new().with_prefix()))
                    .await
            }
        })
        .await
        .map_err(CoordError::meta_store)?;
        let strip = prefix.len();
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| (kv.key()[strip..].to_vec(), kv.value().to_vec()))
            .collect())
    }

    async fn put_cf(&self, cf: &str, key: Key, value: Value) -> CoordResult<()> {
        let encoded = encode_key(cf, &key);
        let mut client = self.client.clone();
        Retry::spawn(Self::retry_strategy(), || {
            let mut client = client.clone();
            let encoded = encoded.clone();
            let value = value.clone();
            async move { client.put(encoded, value, None).await }
        })
        .await
        .map_err(CoordError::meta_store)?;
        Ok(())
    }

    async fn delete_cf(&self, cf: &str, key: &[u8]) -> CoordResult<()> {
        let encoded = encode_key(cf, key);
        let mut client = self.client.clone();
        Retry::spawn(Self::retry_strategy(), || {
            let mut client = client.clone();
            let encoded = encoded.clone();
            async move { client.delete(encoded, None).await }
        })
        .await
        .map_err(CoordError::meta_store)?;
        Ok(())
    }

    async fn txn(&self, txn: Transaction) -> CoordResult<bool> {
        let (preconditions, operations) = txn.into_parts();
        let when: Vec<Compare> = preconditions
            .into_iter()
            .map(|cond| match cond {
                Precondition::KeyExists { cf, key } => {
                    Compare::value(encode_key(&cf, &key), CompareOp::NotEqual, vec![])
                }
                Precondition::KeyEqual { cf, key, value } => {
                    Compare::value(encode_key(&cf, &key), CompareOp::Equal, value)
                }
            })
            .collect();
        let then: Vec<TxnOp> = operations
            .into_iter()
            .map(|op| match op {
                Operation::Put { cf, key, value } => TxnOp::put(encode_key(&cf, &key), value, None),
                Operation::Delete { cf, key } => TxnOp::delete(encode_key(&cf, &key), None),
            })
            .collect();

        let etcd_txn = Txn::new().when(when).and_then(then);
        let mut client = self.client.clone();
        let resp = client.txn(etcd_txn).await.map_err(CoordError::meta_store)?;
        Ok(resp.succeeded())
    }
}
