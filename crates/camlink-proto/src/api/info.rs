//! Product info and device housekeeping commands

use bytes::Bytes;
use rmpv::Value;
use tracing::{debug, info, instrument};

use super::{check_status, Api, Command, ProductInfoMode};
use crate::codec::{self, DecodeKind};
use crate::error::{ApiError, ApiResult};
use crate::topics::{camctrl, error_logger, prodinfo};

fn is_empty_info(value: &Value) -> bool {
    match value {
        Value::Nil => true,
        Value::Map(entries) => entries.is_empty(),
        _ => false,
    }
}

impl Api {
    /// Read the device's product info map
    ///
    /// The structured command is tried first; if it fails or comes back
    /// empty the legacy bulk-transfer command is used. The working mode is
    /// cached so later calls go straight to it.
    #[instrument(skip(self))]
    pub async fn get_product_info(&self) -> ApiResult<Value> {
        match self.product_info_mode() {
            ProductInfoMode::Structured => {
                self.product_info_structured()
                    .await?
                    .ok_or_else(|| ApiError::UnexpectedReply {
                        command: prodinfo::GET_MSGPACK.to_string(),
                        reason: "empty product info".to_string(),
                    })
            }
            ProductInfoMode::Legacy => self.product_info_legacy().await,
            ProductInfoMode::Unknown => match self.product_info_structured().await {
                Ok(Some(info)) if !is_empty_info(&info) => {
                    self.set_product_info_mode(ProductInfoMode::Structured);
                    Ok(info)
                }
                probe => {
                    debug!(probe = ?probe.err(), "Structured product info unavailable, using legacy");
                    let info = self.product_info_legacy().await?;
                    self.set_product_info_mode(ProductInfoMode::Legacy);
                    Ok(info)
                }
            },
        }
    }

    async fn product_info_structured(&self) -> ApiResult<Option<Value>> {
        let reply = self
            .send_and_receive_exclusive(&[], &Command::with_reply(prodinfo::GET_MSGPACK), None)
            .await?;
        codec::decode_message_pack(&reply.payload)
    }

    async fn product_info_legacy(&self) -> ApiResult<Value> {
        let raw = self.bulk_read(prodinfo::GET, &[]).await?;
        codec::decode_message_pack(&raw)?.ok_or_else(|| ApiError::UnexpectedReply {
            command: prodinfo::GET.to_string(),
            reason: "empty product info".to_string(),
        })
    }

    /// Write the device's product info map, in whichever mode the device supports
    #[instrument(skip(self, info))]
    pub async fn set_product_info(&self, info: &Value) -> ApiResult<()> {
        if self.product_info_mode() == ProductInfoMode::Unknown {
            self.get_product_info().await?;
        }

        match self.product_info_mode() {
            ProductInfoMode::Legacy => {
                let payload = codec::encode_message_pack(info)?;
                self.async_file_transfer(prodinfo::SET, payload, None)
                    .await?;
            }
            _ => {
                let reply = self
                    .send_and_receive_message_pack(
                        info,
                        &Command::with_reply(prodinfo::SET_MSGPACK),
                        None,
                    )
                    .await?;
                check_status(prodinfo::SET_MSGPACK, reply.as_ref())?;
            }
        }
        info!("Product info updated");
        Ok(())
    }

    /// Seconds since the device booted
    pub async fn uptime(&self) -> ApiResult<f64> {
        let reply = self
            .send_and_receive_exclusive(&[], &Command::with_reply(camctrl::UPTIME), None)
            .await?;
        codec::decode(&reply.payload, DecodeKind::Double)?
            .as_double()
            .ok_or_else(|| ApiError::Decode("uptime is not a double".to_string()))
    }

    /// Ask the device to reboot; no reply is expected
    ///
    /// `mode` is passed to the firmware unchanged (e.g. `"normal"`).
    #[instrument(skip(self))]
    pub async fn reboot(&self, mode: &str) -> ApiResult<()> {
        let payload = codec::encode_message_pack(&Value::from(mode))?;
        self.locksmith
            .execute_exclusively(move || async move {
                self.write(camctrl::REBOOT, &payload).await
            })
            .await
    }

    /// Read the persisted device error log
    pub async fn read_error_log(&self) -> ApiResult<Bytes> {
        self.locksmith
            .execute_exclusively(move || async move {
                self.bulk_read(error_logger::READ, &[]).await
            })
            .await
    }

    pub async fn erase_error_log(&self) -> ApiResult<()> {
        let reply = self
            .send_and_receive_exclusive(&[], &Command::with_reply(error_logger::ERASE), None)
            .await?;
        let decoded = codec::decode_message_pack(&reply.payload)?;
        check_status(error_logger::ERASE, decoded.as_ref())
    }
}
