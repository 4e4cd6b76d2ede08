//! Payment provider integration.
//!
//! Bookings are paid through Midtrans Snap: the API creates a transaction and
//! hands the student a checkout link, then Midtrans reports the outcome
//! through an HTTP notification (webhook). Refunds go through the Core API.
//!
//! [`MockPaymentGateway`] stands in for Midtrans in development and tests. It
//! signs and verifies notifications with the same algorithm, so webhook tests
//! exercise the real verification path.

use crate::types::{BookingId, Money};
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by gateway calls
pub type GatewayFuture<T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send>>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The provider could not be reached or timed out
    #[error("payment provider unreachable: {0}")]
    Transport(String),

    /// The provider answered with an error
    #[error("payment provider rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP or provider status code
        status: String,
        /// Provider message
        message: String,
    },

    /// The provider answered with something we could not parse
    #[error("unexpected payment provider response: {0}")]
    InvalidResponse(String),

    /// An inbound notification was malformed
    #[error("invalid notification payload: {0}")]
    InvalidPayload(String),
}

/// A request to open a checkout for one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    /// Order id, unique per attempt
    pub order_id: String,
    /// Booking being paid
    pub booking_id: BookingId,
    /// Amount to charge
    pub amount: Money,
    /// Line item shown on the checkout page
    pub item_name: String,
}

/// Checkout link returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLink {
    /// Snap token (used by the front end's embedded checkout)
    pub token: String,
    /// Hosted checkout page
    pub redirect_url: String,
}

/// A refund of a settled payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    /// Order id of the settled attempt
    pub order_id: String,
    /// Amount to return
    pub amount: Money,
    /// Reason forwarded to the provider
    pub reason: String,
}

/// Provider acknowledgement of a refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    /// Provider refund reference, if it returned one
    pub reference: Option<String>,
}

/// Normalised outcome of a provider notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Money captured
    Settled,
    /// Still waiting (bank transfer not paid yet, fraud review)
    Pending,
    /// Denied or failed
    Failed,
    /// Provider expired the transaction
    Expired,
    /// Cancelled at the provider
    Cancelled,
    /// Refunded (fully or partially) at the provider
    Refunded,
    /// Status this service does not act on
    Unknown(String),
}

impl TransactionStatus {
    /// Map Midtrans `transaction_status` / `fraud_status` to a status.
    #[must_use]
    pub fn from_provider(transaction_status: &str, fraud_status: Option<&str>) -> Self {
        match (transaction_status, fraud_status) {
            ("capture", None | Some("accept")) | ("settlement", _) => Self::Settled,
            ("capture", Some("challenge")) | ("pending", _) => Self::Pending,
            ("capture", Some("deny")) | ("deny" | "failure", _) => Self::Failed,
            ("expire", _) => Self::Expired,
            ("cancel", _) => Self::Cancelled,
            ("refund" | "partial_refund", _) => Self::Refunded,
            (other, _) => Self::Unknown(other.to_string()),
        }
    }
}

/// A verified, parsed provider notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    /// Order id of the attempt
    pub order_id: String,
    /// Normalised status
    pub status: TransactionStatus,
    /// Amount the provider reports
    pub gross_amount: Money,
    /// Provider transaction id
    pub transaction_id: Option<String>,
    /// Payment channel
    pub payment_type: Option<String>,
}

/// Raw Midtrans HTTP notification body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Order id
    pub order_id: String,
    /// Provider status code (`"200"`, `"201"`, `"202"`, …)
    pub status_code: String,
    /// Decimal amount (`"150000.00"`)
    pub gross_amount: String,
    /// hex(SHA-512(order_id + status_code + gross_amount + server_key))
    pub signature_key: String,
    /// Provider transaction status
    pub transaction_status: String,
    /// Fraud screening outcome (card payments)
    #[serde(default)]
    pub fraud_status: Option<String>,
    /// Provider transaction id
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Payment channel
    #[serde(default)]
    pub payment_type: Option<String>,
}

impl WebhookPayload {
    /// Parse into a [`PaymentNotification`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidPayload`] when the order id is empty or
    /// the amount is not a whole non-negative number.
    pub fn into_notification(self) -> GatewayResult<PaymentNotification> {
        if self.order_id.trim().is_empty() {
            return Err(GatewayError::InvalidPayload("missing order_id".to_string()));
        }
        let gross_amount = Money::parse_decimal(&self.gross_amount).ok_or_else(|| {
            GatewayError::InvalidPayload(format!("invalid gross_amount {}", self.gross_amount))
        })?;

        Ok(PaymentNotification {
            status: TransactionStatus::from_provider(
                &self.transaction_status,
                self.fraud_status.as_deref(),
            ),
            order_id: self.order_id,
            gross_amount,
            transaction_id: self.transaction_id,
            payment_type: self.payment_type,
        })
    }
}

/// Compute the notification signature Midtrans sends.
#[must_use]
pub fn notification_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn signature_matches(payload: &WebhookPayload, server_key: &str) -> bool {
    let expected = notification_signature(
        &payload.order_id,
        &payload.status_code,
        &payload.gross_amount,
        server_key,
    );
    constant_time_eq::constant_time_eq(
        expected.as_bytes(),
        payload.signature_key.to_ascii_lowercase().as_bytes(),
    )
}

/// Payment gateway trait
///
/// Abstraction over the payment provider.
pub trait PaymentGateway: Send + Sync {
    /// Open a checkout for one payment attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the transaction or is unreachable
    fn create_transaction(&self, request: TransactionRequest) -> GatewayFuture<CheckoutLink>;

    /// Refund a settled payment.
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the refund or is unreachable
    fn refund(&self, request: RefundRequest) -> GatewayFuture<RefundReceipt>;

    /// Whether an inbound notification carries a valid signature.
    fn verify_signature(&self, payload: &WebhookPayload) -> bool;
}

// ============================================================================
// Midtrans
// ============================================================================

const SANDBOX_SNAP_URL: &str = "https://app.sandbox.midtrans.com";
const PRODUCTION_SNAP_URL: &str = "https://app.midtrans.com";
const SANDBOX_API_URL: &str = "https://api.sandbox.midtrans.com";
const PRODUCTION_API_URL: &str = "https://api.midtrans.com";

/// Midtrans Snap + Core API client.
#[derive(Clone)]
pub struct MidtransGateway {
    server_key: Arc<str>,
    snap_base_url: String,
    api_base_url: String,
    http_client: Client,
}

impl std::fmt::Debug for MidtransGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidtransGateway")
            .field("snap_base_url", &self.snap_base_url)
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

impl MidtransGateway {
    /// Client for the sandbox or production environment.
    #[must_use]
    pub fn new(server_key: String, production: bool) -> Self {
        let (snap, api) = if production {
            (PRODUCTION_SNAP_URL, PRODUCTION_API_URL)
        } else {
            (SANDBOX_SNAP_URL, SANDBOX_API_URL)
        };
        Self {
            server_key: server_key.into(),
            snap_base_url: snap.to_string(),
            api_base_url: api.to_string(),
            http_client: Client::new(),
        }
    }

    /// Point both APIs at another host (a local stub server).
    #[must_use]
    pub fn with_base_urls(mut self, snap: impl Into<String>, api: impl Into<String>) -> Self {
        self.snap_base_url = snap.into();
        self.api_base_url = api.into();
        self
    }

    fn authorization(&self) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:", self.server_key)))
    }
}

#[derive(Serialize)]
struct SnapTransactionBody<'a> {
    transaction_details: SnapTransactionDetails<'a>,
    item_details: [SnapItem<'a>; 1],
}

#[derive(Serialize)]
struct SnapTransactionDetails<'a> {
    order_id: &'a str,
    gross_amount: i64,
}

#[derive(Serialize)]
struct SnapItem<'a> {
    id: String,
    price: i64,
    quantity: u32,
    name: &'a str,
}

#[derive(Deserialize)]
struct SnapTransactionResponse {
    token: String,
    redirect_url: String,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    refund_key: String,
    amount: i64,
    reason: &'a str,
}

#[derive(Deserialize)]
struct CoreApiResponse {
    status_code: Option<String>,
    status_message: Option<String>,
    refund_key: Option<String>,
}

async fn provider_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16().to_string();
    let message = response.text().await.unwrap_or_default();
    GatewayError::Rejected { status, message }
}

impl PaymentGateway for MidtransGateway {
    fn create_transaction(&self, request: TransactionRequest) -> GatewayFuture<CheckoutLink> {
        let client = self.http_client.clone();
        let url = format!("{}/snap/v1/transactions", self.snap_base_url);
        let authorization = self.authorization();

        Box::pin(async move {
            // Midtrans caps item names at 50 characters.
            let name: String = request.item_name.chars().take(50).collect();
            let body = SnapTransactionBody {
                transaction_details: SnapTransactionDetails {
                    order_id: &request.order_id,
                    gross_amount: request.amount.rupiah(),
                },
                item_details: [SnapItem {
                    id: request.booking_id.to_string(),
                    price: request.amount.rupiah(),
                    quantity: 1,
                    name: &name,
                }],
            };

            let response = client
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                let error = provider_error(response).await;
                tracing::error!(order_id = %request.order_id, %error, "Snap transaction rejected");
                return Err(error);
            }

            let snap: SnapTransactionResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

            tracing::info!(order_id = %request.order_id, "Snap transaction created");

            Ok(CheckoutLink {
                token: snap.token,
                redirect_url: snap.redirect_url,
            })
        })
    }

    fn refund(&self, request: RefundRequest) -> GatewayFuture<RefundReceipt> {
        let client = self.http_client.clone();
        let url = format!("{}/v2/{}/refund", self.api_base_url, request.order_id);
        let authorization = self.authorization();

        Box::pin(async move {
            let body = RefundBody {
                refund_key: format!("{}-refund", request.order_id),
                amount: request.amount.rupiah(),
                reason: &request.reason,
            };

            let response = client
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(provider_error(response).await);
            }

            let parsed: CoreApiResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

            // The Core API reports failures with HTTP 200 and an error status_code in the body.
            let status = parsed.status_code.unwrap_or_default();
            if !status.starts_with('2') {
                return Err(GatewayError::Rejected {
                    status,
                    message: parsed.status_message.unwrap_or_default(),
                });
            }

            tracing::info!(order_id = %request.order_id, "Refund accepted by Midtrans");

            Ok(RefundReceipt {
                reference: parsed.refund_key,
            })
        })
    }

    fn verify_signature(&self, payload: &WebhookPayload) -> bool {
        signature_matches(payload, &self.server_key)
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Server key the mock gateway signs notifications with.
pub const MOCK_SERVER_KEY: &str = "mock-server-key";

/// In-process gateway (always succeeds unless told otherwise).
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    fail_transactions: Arc<AtomicBool>,
    fail_refunds: Arc<AtomicBool>,
    refunds: Arc<Mutex<Vec<RefundRequest>>>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Make subsequent `create_transaction` calls fail.
    pub fn fail_transactions(&self, fail: bool) {
        self.fail_transactions.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent refunds fail.
    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Refunds requested so far.
    #[must_use]
    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.refunds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Build a correctly signed notification, as Midtrans would send it.
    #[must_use]
    pub fn signed_payload(
        order_id: &str,
        transaction_status: &str,
        amount: Money,
    ) -> WebhookPayload {
        let status_code = match transaction_status {
            "capture" | "settlement" | "refund" | "partial_refund" => "200",
            "pending" => "201",
            _ => "202",
        };
        let gross_amount = format!("{}.00", amount.rupiah());
        WebhookPayload {
            signature_key: notification_signature(
                order_id,
                status_code,
                &gross_amount,
                MOCK_SERVER_KEY,
            ),
            order_id: order_id.to_string(),
            status_code: status_code.to_string(),
            gross_amount,
            transaction_status: transaction_status.to_string(),
            fraud_status: None,
            transaction_id: Some(format!("mock-txn-{order_id}")),
            payment_type: Some("bank_transfer".to_string()),
        }
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_transaction(&self, request: TransactionRequest) -> GatewayFuture<CheckoutLink> {
        let fail = self.fail_transactions.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                return Err(GatewayError::Transport("mock gateway offline".to_string()));
            }
            tracing::info!(
                order_id = %request.order_id,
                amount = request.amount.rupiah(),
                "Mock checkout created"
            );
            Ok(CheckoutLink {
                token: format!("mock-token-{}", request.order_id),
                redirect_url: format!("https://pay.mock.local/checkout/{}", request.order_id),
            })
        })
    }

    fn refund(&self, request: RefundRequest) -> GatewayFuture<RefundReceipt> {
        let fail = self.fail_refunds.load(Ordering::SeqCst);
        let refunds = Arc::clone(&self.refunds);
        Box::pin(async move {
            if fail {
                return Err(GatewayError::Rejected {
                    status: "412".to_string(),
                    message: "mock refund rejected".to_string(),
                });
            }
            let reference = format!("{}-refund", request.order_id);
            refunds
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            Ok(RefundReceipt {
                reference: Some(reference),
            })
        })
    }

    fn verify_signature(&self, payload: &WebhookPayload) -> bool {
        signature_matches(payload, MOCK_SERVER_KEY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use TransactionStatus as S;
        assert_eq!(S::from_provider("capture", Some("accept")), S::Settled);
        assert_eq!(S::from_provider("capture", None), S::Settled);
        assert_eq!(S::from_provider("capture", Some("challenge")), S::Pending);
        assert_eq!(S::from_provider("settlement", None), S::Settled);
        assert_eq!(S::from_provider("pending", None), S::Pending);
        assert_eq!(S::from_provider("deny", None), S::Failed);
        assert_eq!(S::from_provider("failure", None), S::Failed);
        assert_eq!(S::from_provider("expire", None), S::Expired);
        assert_eq!(S::from_provider("cancel", None), S::Cancelled);
        assert_eq!(S::from_provider("partial_refund", None), S::Refunded);
        assert_eq!(
            S::from_provider("authorize", None),
            S::Unknown("authorize".to_string())
        );
    }

    #[test]
    fn test_signature_round_trip() {
        let gateway = MockPaymentGateway::new();
        let payload = MockPaymentGateway::signed_payload(
            "BP-1a2b3c4d-1",
            "settlement",
            Money::from_rupiah(150_000),
        );
        assert!(gateway.verify_signature(&payload));

        let mut tampered = payload;
        tampered.gross_amount = "1.00".to_string();
        assert!(!gateway.verify_signature(&tampered));
    }

    #[test]
    fn test_midtrans_rejects_mock_signature() {
        let gateway = MidtransGateway::new("SB-Mid-server-real".to_string(), false);
        let payload =
            MockPaymentGateway::signed_payload("BP-x-1", "settlement", Money::from_rupiah(1));
        assert!(!gateway.verify_signature(&payload));
    }

    #[test]
    fn test_payload_into_notification() {
        let payload = MockPaymentGateway::signed_payload(
            "BP-1a2b3c4d-2",
            "expire",
            Money::from_rupiah(75_000),
        );
        let notification = payload.into_notification().unwrap();
        assert_eq!(notification.status, TransactionStatus::Expired);
        assert_eq!(notification.gross_amount, Money::from_rupiah(75_000));
    }

    #[test]
    fn test_payload_with_fractional_amount_is_rejected() {
        let mut payload =
            MockPaymentGateway::signed_payload("BP-x-1", "settlement", Money::from_rupiah(10));
        payload.gross_amount = "10.50".to_string();
        assert!(matches!(
            payload.into_notification(),
            Err(GatewayError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_refund_is_recorded() {
        let gateway = MockPaymentGateway::new();
        let receipt = gateway
            .refund(RefundRequest {
                order_id: "BP-x-1".to_string(),
                amount: Money::from_rupiah(100),
                reason: "cancelled".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.reference.as_deref(), Some("BP-x-1-refund"));
        assert_eq!(gateway.refunds().len(), 1);

        gateway.fail_refunds(true);
        let result = gateway
            .refund(RefundRequest {
                order_id: "BP-x-2".to_string(),
                amount: Money::from_rupiah(100),
                reason: "cancelled".to_string(),
            })
            .await;
        assert!(result.is_err());
    }
}
