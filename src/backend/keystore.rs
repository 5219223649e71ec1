//! Key store over a `file://` kOps state registry.
//!
//! CA material lives under `<cluster>/pki/issued/<signer>/*.crt` and
//! `<cluster>/pki/private/<signer>/*.key`; client certificates are issued
//! locally, signed by the resolved CA key.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use super::{BackendError, IssueCertRequest, IssuedCert, KeySet, KeyStore};

pub struct FsKeyStore {
    base: PathBuf,
}

impl FsKeyStore {
    pub fn open(state_store: &str, cluster_name: &str) -> Result<Self, BackendError> {
        let root = match state_store.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, _)) => {
                return Err(BackendError::Api(format!(
                    "key store access requires a file:// state store, got {scheme}://"
                )))
            }
            None => state_store,
        };
        Ok(Self {
            base: Path::new(root).join(cluster_name).join("pki"),
        })
    }

    async fn read_sorted(&self, dir: PathBuf, ext: &str) -> Result<Option<Vec<Vec<u8>>>, BackendError> {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Ok(None);
        }
        paths.sort();
        let mut contents = Vec::with_capacity(paths.len());
        for path in paths {
            contents.push(tokio::fs::read(&path).await?);
        }
        Ok(Some(contents))
    }

    async fn signer_key(&self, signer: &str) -> Result<Vec<u8>, BackendError> {
        self.read_sorted(self.base.join("private").join(signer), "key")
            .await?
            // Highest-sorted key is the active one.
            .and_then(|mut keys| keys.pop())
            .ok_or_else(|| BackendError::not_found("signer key", signer))
    }
}

impl KeyStore for FsKeyStore {
    async fn find_keyset(&self, signer: &str) -> Result<Option<KeySet>, BackendError> {
        let Some(certs) = self
            .read_sorted(self.base.join("issued").join(signer), "crt")
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(KeySet {
            certificates: certs.concat(),
        }))
    }

    async fn issue_cert(&self, request: &IssueCertRequest) -> Result<IssuedCert, BackendError> {
        let keyset = self
            .find_keyset(&request.signer)
            .await?
            .ok_or_else(|| BackendError::not_found("signer keyset", &request.signer))?;
        let key = self.signer_key(&request.signer).await?;
        sign_client_cert(&keyset.certificates, &key, request)
    }
}

fn sign_client_cert(
    ca_bundle: &[u8],
    ca_key_pem: &[u8],
    request: &IssueCertRequest,
) -> Result<IssuedCert, BackendError> {
    let ca_certs = X509::stack_from_pem(ca_bundle)?;
    let ca = ca_certs
        .last()
        .ok_or_else(|| BackendError::Api("signer bundle holds no certificates".into()))?;
    let ca_key = PKey::private_key_from_pem(ca_key_pem)?;

    let client_key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut subject = X509NameBuilder::new()?;
    subject.append_entry_by_text("CN", &request.common_name)?;
    for org in &request.organizations {
        subject.append_entry_by_text("O", org)?;
    }
    let subject = subject.build();

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = {
        let mut bn = BigNum::new()?;
        bn.rand(128, MsbOption::MAYBE_ZERO, false)?;
        bn.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(ca.subject_name())?;
    builder.set_pubkey(&client_key)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    builder.set_not_before(Asn1Time::from_unix(now)?.as_ref())?;
    builder.set_not_after(Asn1Time::from_unix(now + request.validity.as_secs() as i64)?.as_ref())?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;

    builder.sign(&ca_key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok(IssuedCert {
        certificate: cert.to_pem()?,
        private_key: client_key.private_key_to_pem_pkcs8()?,
    })
}
