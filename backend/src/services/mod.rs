// Services
//
// Record orchestration and the collaborators automation and approvals call
// into: audit trail, email, outbound webhooks, data sync and system modules.

pub mod audit;
pub mod email;
pub mod modules;
pub mod records;
pub mod sync;
pub mod system_modules;
pub mod webhooks;

pub use audit::{AuditAction, AuditEntryBuilder, AuditService, ChangeTracker};
pub use email::{EmailTemplateService, LogMailer, MailError, Mailer, SmtpMailer};
pub use modules::{ModuleFieldsInput, ModuleInput, ModuleService};
pub use records::{RecordDocument, RecordOrchestrator, RecordPage};
pub use sync::{HttpSyncService, SyncError, SyncReport, SyncService};
pub use webhooks::WebhookService;
