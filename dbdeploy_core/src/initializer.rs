//! Database initializers.
//!
//! An initializer describes what happens to a database whose context has
//! never been deployed: it is created, migrated to the latest migration, a
//! service account may be provisioned and seed data may be loaded. The
//! [`crate::manager::DeploymentManager`] carries out those steps; initializers
//! only declare which of them apply.
//!
//! Initializers are selected with a descriptor string such as
//! `CreateSecureSeededDatabaseIfNotExists<Clinical.Context, Clinical.Seed>`
//! and constructed through an [`InitializerRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ServiceAccountInfo;

/// Kind tag of [`CreateDatabaseIfNotExists`].
pub const CREATE_DATABASE_IF_NOT_EXISTS: &str = "CreateDatabaseIfNotExists";
/// Kind tag of [`CreateSecureDatabaseIfNotExists`].
pub const CREATE_SECURE_DATABASE_IF_NOT_EXISTS: &str = "CreateSecureDatabaseIfNotExists";
/// Kind tag of [`CreateSecureSeededDatabaseIfNotExists`].
pub const CREATE_SECURE_SEEDED_DATABASE_IF_NOT_EXISTS: &str =
    "CreateSecureSeededDatabaseIfNotExists";

/// Errors raised while resolving initializers.
#[derive(Debug, thiserror::Error)]
pub enum InitializerError {
    /// The descriptor string is malformed.
    #[error("Invalid initializer descriptor '{0}', expected 'Kind<ContextType[, SeederType]>'")]
    InvalidDescriptor(String),

    /// No constructor is registered for the kind.
    #[error("Unknown database initializer kind '{0}'")]
    UnknownKind(String),

    /// The kind requires a seeder type.
    #[error("Database initializer {0} requires a seeder type")]
    MissingSeeder(String),

    /// The kind does not take a seeder type.
    #[error("Database initializer {0} does not take a seeder type")]
    UnexpectedSeeder(String),

    /// The configured account type is unknown.
    #[error("Unknown service account type '{0}', expected 'Sql' or 'Windows'")]
    InvalidAccountType(String),
}

/// An initializer selection: kind plus generic arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitializerDescriptor {
    /// Kind tag, e.g. `CreateDatabaseIfNotExists`.
    pub kind: String,
    /// Context type the initializer applies to.
    pub context_type: String,
    /// Seeder type of seeded initializers.
    pub seeder_type: Option<String>,
}

impl fmt::Display for InitializerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.seeder_type {
            Some(seeder) => write!(f, "{}<{}, {}>", self.kind, self.context_type, seeder),
            None => write!(f, "{}<{}>", self.kind, self.context_type),
        }
    }
}

impl FromStr for InitializerDescriptor {
    type Err = InitializerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InitializerError::InvalidDescriptor(s.to_string());
        let trimmed = s.trim();
        let (kind, rest) = trimmed.split_once('<').ok_or_else(invalid)?;
        let arguments = rest.strip_suffix('>').ok_or_else(invalid)?;

        let arguments: Vec<&str> = arguments.split(',').map(str::trim).collect();
        let kind = kind.trim();
        if kind.is_empty() || arguments.iter().any(|argument| argument.is_empty()) {
            return Err(invalid());
        }
        match arguments.as_slice() {
            [context] => Ok(Self {
                kind: kind.to_string(),
                context_type: context.to_string(),
                seeder_type: None,
            }),
            [context, seeder] => Ok(Self {
                kind: kind.to_string(),
                context_type: context.to_string(),
                seeder_type: Some(seeder.to_string()),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Kind of service account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceAccountType {
    /// Login with a password.
    Sql,
    /// Externally authenticated domain account.
    Windows,
}

impl FromStr for ServiceAccountType {
    type Err = InitializerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(ServiceAccountType::Sql),
            "windows" => Ok(ServiceAccountType::Windows),
            _ => Err(InitializerError::InvalidAccountType(s.to_string())),
        }
    }
}

/// A service account assigned to a secure initializer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    /// Login name.
    pub name: Option<String>,
    /// Domain of a Windows account.
    pub domain: Option<String>,
    /// Database user mapped to the login.
    pub database_user: Option<String>,
    /// Password of a SQL account.
    pub database_user_password: Option<String>,
    /// The account type, `None` when not configured.
    pub account_type: Option<ServiceAccountType>,
}

impl ServiceAccount {
    /// `domain\name` for Windows accounts, `name` otherwise.
    pub fn login_name(&self) -> Option<String> {
        let name = self.name.as_deref()?;
        match (self.account_type, self.domain.as_deref()) {
            (Some(ServiceAccountType::Windows), Some(domain)) => Some(format!("{domain}\\{name}")),
            _ => Some(name.to_string()),
        }
    }

    /// Whether every field required by the account type is present.
    pub fn is_complete(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        match self.account_type {
            Some(ServiceAccountType::Sql) => {
                present(&self.database_user)
                    && present(&self.name)
                    && present(&self.database_user_password)
            }
            Some(ServiceAccountType::Windows) => {
                present(&self.database_user) && present(&self.name) && present(&self.domain)
            }
            None => false,
        }
    }
}

impl TryFrom<&ServiceAccountInfo> for ServiceAccount {
    type Error = InitializerError;

    fn try_from(info: &ServiceAccountInfo) -> Result<Self, Self::Error> {
        let account_type = info
            .account_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        Ok(Self {
            name: info.name.clone(),
            domain: info.domain.clone(),
            database_user: info.database_user.clone(),
            database_user_password: info.database_user_password.clone(),
            account_type,
        })
    }
}

/// A database initializer.
pub trait DatabaseInitializer: fmt::Debug + Send + Sync {
    /// The descriptor the initializer was built from.
    fn descriptor(&self) -> &InitializerDescriptor;

    /// The context type the initializer applies to.
    fn context_type(&self) -> &str {
        &self.descriptor().context_type
    }

    /// The seeder run after initialization, if any.
    fn seeder_type(&self) -> Option<&str> {
        self.descriptor().seeder_type.as_deref()
    }

    /// Whether the initializer provisions a service account.
    fn is_secure(&self) -> bool {
        false
    }

    /// Assigns the service account of a secure initializer.
    fn set_service_account(&mut self, _account: ServiceAccount) {}

    /// The assigned service account.
    fn service_account(&self) -> Option<&ServiceAccount> {
        None
    }
}

/// Creates the database and migrates it to the latest migration.
#[derive(Debug, Clone)]
pub struct CreateDatabaseIfNotExists {
    descriptor: InitializerDescriptor,
}

impl DatabaseInitializer for CreateDatabaseIfNotExists {
    fn descriptor(&self) -> &InitializerDescriptor {
        &self.descriptor
    }
}

/// As [`CreateDatabaseIfNotExists`], then provisions the service account.
#[derive(Debug, Clone)]
pub struct CreateSecureDatabaseIfNotExists {
    descriptor: InitializerDescriptor,
    service_account: Option<ServiceAccount>,
}

impl DatabaseInitializer for CreateSecureDatabaseIfNotExists {
    fn descriptor(&self) -> &InitializerDescriptor {
        &self.descriptor
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn set_service_account(&mut self, account: ServiceAccount) {
        self.service_account = Some(account);
    }

    fn service_account(&self) -> Option<&ServiceAccount> {
        self.service_account.as_ref()
    }
}

/// As [`CreateSecureDatabaseIfNotExists`], then runs the seeder.
#[derive(Debug, Clone)]
pub struct CreateSecureSeededDatabaseIfNotExists {
    inner: CreateSecureDatabaseIfNotExists,
}

impl DatabaseInitializer for CreateSecureSeededDatabaseIfNotExists {
    fn descriptor(&self) -> &InitializerDescriptor {
        self.inner.descriptor()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn set_service_account(&mut self, account: ServiceAccount) {
        self.inner.set_service_account(account);
    }

    fn service_account(&self) -> Option<&ServiceAccount> {
        self.inner.service_account()
    }
}

/// Builds an initializer from its descriptor.
pub type InitializerConstructor =
    fn(&InitializerDescriptor) -> Result<Box<dyn DatabaseInitializer>, InitializerError>;

/// Kind tag to constructor lookup.
#[derive(Debug, Clone)]
pub struct InitializerRegistry {
    constructors: HashMap<String, InitializerConstructor>,
}

impl Default for InitializerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CREATE_DATABASE_IF_NOT_EXISTS, create_database_if_not_exists);
        registry.register(
            CREATE_SECURE_DATABASE_IF_NOT_EXISTS,
            create_secure_database_if_not_exists,
        );
        registry.register(
            CREATE_SECURE_SEEDED_DATABASE_IF_NOT_EXISTS,
            create_secure_seeded_database_if_not_exists,
        );
        registry
    }
}

impl InitializerRegistry {
    /// A registry without the built-in kinds.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers (or replaces) the constructor of `kind`.
    pub fn register(&mut self, kind: &str, constructor: InitializerConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    /// Builds the initializer described by `descriptor`.
    pub fn construct(
        &self,
        descriptor: &InitializerDescriptor,
    ) -> Result<Box<dyn DatabaseInitializer>, InitializerError> {
        let constructor = self
            .constructors
            .get(&descriptor.kind)
            .ok_or_else(|| InitializerError::UnknownKind(descriptor.kind.clone()))?;
        constructor(descriptor)
    }
}

fn create_database_if_not_exists(
    descriptor: &InitializerDescriptor,
) -> Result<Box<dyn DatabaseInitializer>, InitializerError> {
    reject_seeder(descriptor)?;
    Ok(Box::new(CreateDatabaseIfNotExists {
        descriptor: descriptor.clone(),
    }))
}

fn create_secure_database_if_not_exists(
    descriptor: &InitializerDescriptor,
) -> Result<Box<dyn DatabaseInitializer>, InitializerError> {
    reject_seeder(descriptor)?;
    Ok(Box::new(CreateSecureDatabaseIfNotExists {
        descriptor: descriptor.clone(),
        service_account: None,
    }))
}

fn create_secure_seeded_database_if_not_exists(
    descriptor: &InitializerDescriptor,
) -> Result<Box<dyn DatabaseInitializer>, InitializerError> {
    if descriptor.seeder_type.is_none() {
        return Err(InitializerError::MissingSeeder(descriptor.kind.clone()));
    }
    Ok(Box::new(CreateSecureSeededDatabaseIfNotExists {
        inner: CreateSecureDatabaseIfNotExists {
            descriptor: descriptor.clone(),
            service_account: None,
        },
    }))
}

fn reject_seeder(descriptor: &InitializerDescriptor) -> Result<(), InitializerError> {
    match descriptor.seeder_type {
        Some(_) => Err(InitializerError::UnexpectedSeeder(descriptor.kind.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn descriptor_with_seeder_parses() {
        let descriptor: InitializerDescriptor =
            "CreateSecureSeededDatabaseIfNotExists< Clinical.Context , Clinical.Seed >"
                .parse()
                .unwrap();
        assert_eq!(
            descriptor,
            InitializerDescriptor {
                kind: CREATE_SECURE_SEEDED_DATABASE_IF_NOT_EXISTS.to_string(),
                context_type: "Clinical.Context".to_string(),
                seeder_type: Some("Clinical.Seed".to_string()),
            }
        );
        assert_eq!(
            descriptor.to_string(),
            "CreateSecureSeededDatabaseIfNotExists<Clinical.Context, Clinical.Seed>"
        );
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        for value in [
            "CreateDatabaseIfNotExists",
            "CreateDatabaseIfNotExists<>",
            "<Ctx>",
            "CreateDatabaseIfNotExists<Ctx",
            "Kind<A, B, C>",
        ] {
            assert!(
                matches!(
                    value.parse::<InitializerDescriptor>(),
                    Err(InitializerError::InvalidDescriptor(_))
                ),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn registry_builds_builtin_kinds() {
        let registry = InitializerRegistry::default();

        let plain = registry
            .construct(&"CreateDatabaseIfNotExists<Ctx>".parse().unwrap())
            .unwrap();
        assert!(!plain.is_secure());
        assert_eq!(plain.context_type(), "Ctx");

        let mut seeded = registry
            .construct(
                &"CreateSecureSeededDatabaseIfNotExists<Ctx, Seed>"
                    .parse()
                    .unwrap(),
            )
            .unwrap();
        assert!(seeded.is_secure());
        assert_eq!(seeded.seeder_type(), Some("Seed"));
        seeded.set_service_account(ServiceAccount {
            name: Some("svc".to_string()),
            ..Default::default()
        });
        assert_eq!(
            seeded.service_account().and_then(|a| a.name.as_deref()),
            Some("svc")
        );
    }

    #[test]
    fn registry_checks_seeder_arity() {
        let registry = InitializerRegistry::default();
        assert!(matches!(
            registry.construct(&"CreateDatabaseIfNotExists<Ctx, Seed>".parse().unwrap()),
            Err(InitializerError::UnexpectedSeeder(_))
        ));
        assert!(matches!(
            registry.construct(&"CreateSecureSeededDatabaseIfNotExists<Ctx>".parse().unwrap()),
            Err(InitializerError::MissingSeeder(_))
        ));
        assert!(matches!(
            registry.construct(&"DropCreateDatabaseAlways<Ctx>".parse().unwrap()),
            Err(InitializerError::UnknownKind(_))
        ));
    }

    #[test]
    fn account_completeness_depends_on_type() {
        let mut account = ServiceAccount {
            name: Some("svc".to_string()),
            database_user: Some("svc_user".to_string()),
            account_type: Some(ServiceAccountType::Sql),
            ..Default::default()
        };
        assert!(!account.is_complete());
        account.database_user_password = Some("secret".to_string());
        assert!(account.is_complete());

        account.account_type = Some(ServiceAccountType::Windows);
        assert!(!account.is_complete());
        account.domain = Some("CORP".to_string());
        assert!(account.is_complete());
        assert_eq!(account.login_name().as_deref(), Some("CORP\\svc"));

        account.account_type = None;
        assert!(!account.is_complete());
    }

    #[test]
    fn account_type_is_parsed_from_configuration() {
        let info = ServiceAccountInfo {
            name: Some("svc".to_string()),
            account_type: Some("windows".to_string()),
            ..Default::default()
        };
        let account = ServiceAccount::try_from(&info).unwrap();
        assert_eq!(account.account_type, Some(ServiceAccountType::Windows));

        let info = ServiceAccountInfo {
            account_type: Some("Kerberos".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ServiceAccount::try_from(&info),
            Err(InitializerError::InvalidAccountType(_))
        ));
    }
}
