// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 commands that take authorization sessions
//!
//! Each operation takes the session authorizing the target entity and an
//! optional second session that only encrypts. The authorizing session must
//! carry the target's auth value; the encryption session can be shared
//! across operations on unrelated entities.

use tracing::debug;
use zeroize::Zeroizing;

use crate::constants::*;
use crate::context::{Command, Response, TpmContext};
use crate::descriptor::AuthValue;
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::Session;
use crate::types::*;

/// A loaded object and its verified name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedObject {
    pub handle: u32,
    pub name: Vec<u8>,
    pub public: TpmtPublic,
}

impl LoadedObject {
    pub fn entity(&self) -> Entity {
        Entity::new(self.handle, self.name.clone())
    }
}

/// Output of TPM2_Create, ready for TPM2_Load
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub private: Tpm2bPrivate,
    pub public: Tpm2bPublic,
}

/// A defined NV index; consumed by [`TpmContext::nv_undefine_space`]
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvIndexInfo {
    pub handle: u32,
    pub name: Vec<u8>,
    pub public: TpmsNvPublic,
}

impl NvIndexInfo {
    pub fn entity(&self) -> Entity {
        Entity::new(self.handle, self.name.clone())
    }
}

fn check_name(what: &str, expected: &[u8], reported: &[u8]) -> Result<()> {
    if expected != reported {
        return Err(Error::protocol(format!(
            "{what}: name reported by the TPM does not match its public area"
        )));
    }
    Ok(())
}

/// outPublic ‖ creationData ‖ creationHash ‖ creationTicket, common to Create and CreatePrimary
fn skip_creation_info(buf: &mut ResponseBuffer) -> Result<()> {
    let _creation_data = buf.get_tpm2b()?;
    let _creation_hash = Tpm2bDigest::unmarshal(buf)?;
    let _ticket = TpmtTkCreation::unmarshal(buf)?;
    Ok(())
}

impl<T: Transport> TpmContext<T> {
    fn run(
        &mut self,
        command: &Command,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
    ) -> Result<Response> {
        match encrypt {
            Some(enc) => self.execute(command, &mut [auth, enc]),
            None => self.execute(command, &mut [auth]),
        }
    }

    // ==================== Object Operations ====================

    /// TPM2_CreatePrimary under `hierarchy` with `key_auth` as the new key's auth value
    pub fn create_primary(
        &mut self,
        hierarchy: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        template: &TpmtPublic,
        key_auth: &AuthValue,
    ) -> Result<LoadedObject> {
        let sensitive = Tpm2bSensitiveCreate::with_auth(key_auth.as_bytes());
        let mut cmd = Command::new(TpmCc::CreatePrimary);
        cmd.add_auth_handle(hierarchy.clone())?;
        cmd.add_sensitive(&sensitive.contents())?;
        cmd.add(&Tpm2bPublic::from_template(template));
        cmd.add_tpm2b(&[]); // outsideInfo
        cmd.add(&0u32); // creationPCR: empty TPML_PCR_SELECTION
        cmd.expect_handles(1);

        let response = self.run(&cmd, auth, encrypt)?;
        let handle = response
            .handles
            .first()
            .copied()
            .ok_or_else(|| Error::protocol("CreatePrimary returned no handle"))?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        skip_creation_info(&mut buf)?;
        let name = buf.get_tpm2b()?;
        buf.finish()?;

        let public = out_public.parse()?;
        check_name("CreatePrimary", &public.name()?, &name)?;
        debug!("created primary 0x{handle:08x} under 0x{:08x}", hierarchy.handle);
        Ok(LoadedObject {
            handle,
            name,
            public,
        })
    }

    /// TPM2_Create of a child object under `parent`
    pub fn create(
        &mut self,
        parent: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        template: &TpmtPublic,
        sensitive: &Tpm2bSensitiveCreate,
    ) -> Result<CreatedObject> {
        let mut cmd = Command::new(TpmCc::Create);
        cmd.add_auth_handle(parent.clone())?;
        cmd.add_sensitive(&sensitive.contents())?;
        cmd.add(&Tpm2bPublic::from_template(template));
        cmd.add_tpm2b(&[]); // outsideInfo
        cmd.add(&0u32); // creationPCR
        cmd.expect_sensitive_response();

        let response = self.run(&cmd, auth, encrypt)?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let private = Tpm2bPrivate::unmarshal(&mut buf)?;
        let public = Tpm2bPublic::unmarshal(&mut buf)?;
        skip_creation_info(&mut buf)?;
        buf.finish()?;
        debug!("created object under 0x{:08x}", parent.handle);
        Ok(CreatedObject { private, public })
    }

    /// TPM2_Load of an object created under `parent`
    pub fn load(
        &mut self,
        parent: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        object: &CreatedObject,
    ) -> Result<LoadedObject> {
        let mut cmd = Command::new(TpmCc::Load);
        cmd.add_auth_handle(parent.clone())?;
        cmd.add(&object.private);
        cmd.add(&object.public);
        cmd.expect_handles(1);

        let response = self.run(&cmd, auth, encrypt)?;
        let handle = response
            .handles
            .first()
            .copied()
            .ok_or_else(|| Error::protocol("Load returned no handle"))?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let name = buf.get_tpm2b()?;
        buf.finish()?;

        let public = object.public.parse()?;
        check_name("Load", &public.name()?, &name)?;
        debug!("loaded object 0x{handle:08x}");
        Ok(LoadedObject {
            handle,
            name,
            public,
        })
    }

    /// Seal `data` under `parent`; unsealing needs `seal_auth`
    pub fn seal(
        &mut self,
        parent: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        data: &[u8],
        seal_auth: &AuthValue,
    ) -> Result<CreatedObject> {
        if data.len() > MAX_SYM_DATA {
            return Err(Error::config(format!(
                "sealed data of {} bytes exceeds the {MAX_SYM_DATA} byte limit",
                data.len()
            )));
        }
        let sensitive = Tpm2bSensitiveCreate::new(seal_auth.as_bytes(), data);
        self.create(parent, auth, encrypt, &TpmtPublic::sealed_object(), &sensitive)
    }

    /// TPM2_Unseal of a loaded sealed object
    pub fn unseal(
        &mut self,
        item: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut cmd = Command::new(TpmCc::Unseal);
        cmd.add_auth_handle(item.clone())?;
        cmd.expect_sensitive_response();

        let response = self.run(&cmd, auth, encrypt)?;
        let mut buf = ResponseBuffer::new(&response.parameters);
        let data = Zeroizing::new(buf.get_tpm2b()?);
        buf.finish()?;
        Ok(data)
    }

    /// TPM2_ReadPublic; no authorization needed
    pub fn read_public(&mut self, handle: u32) -> Result<LoadedObject> {
        let mut cmd = Command::new(TpmCc::ReadPublic);
        cmd.add_handle(Entity::new(handle, Vec::new()));
        let response = self.execute(&cmd, &mut [])?;

        let mut buf = ResponseBuffer::new(&response.parameters);
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let name = buf.get_tpm2b()?;
        let _qualified_name = buf.get_tpm2b()?;
        buf.finish()?;

        let public = out_public.parse()?;
        check_name("ReadPublic", &public.name()?, &name)?;
        Ok(LoadedObject {
            handle,
            name,
            public,
        })
    }

    /// TPM2_FlushContext of a transient object
    pub fn flush_context(&mut self, object: LoadedObject) -> Result<()> {
        debug!("flushing object 0x{:08x}", object.handle);
        self.flush_handle(object.handle)
    }

    // ==================== Hierarchy Operations ====================

    /// TPM2_HierarchyChangeAuth
    ///
    /// `auth` keeps the old value; build a new session to authorize with
    /// `new_auth` afterwards.
    pub fn hierarchy_change_auth(
        &mut self,
        hierarchy: &Entity,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        new_auth: &AuthValue,
    ) -> Result<()> {
        let mut cmd = Command::new(TpmCc::HierarchyChangeAuth);
        cmd.add_auth_handle(hierarchy.clone())?;
        cmd.add_sensitive(new_auth.as_bytes())?;
        cmd.replaces_auth(new_auth.clone());

        let response = self.run(&cmd, auth, encrypt)?;
        ResponseBuffer::new(&response.parameters).finish()?;
        debug!("changed auth of hierarchy 0x{:08x}", hierarchy.handle);
        Ok(())
    }

    // ==================== NV Operations ====================

    /// TPM2_NV_DefineSpace under owner authorization
    ///
    /// The index is readable and writable with either the owner's or its own
    /// auth value.
    pub fn nv_define_space(
        &mut self,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        index: u32,
        size: u16,
        nv_auth: &AuthValue,
    ) -> Result<NvIndexInfo> {
        if TpmHt::of(index) != Some(TpmHt::NvIndex) {
            return Err(Error::config(format!("0x{index:08x} is not an NV index handle")));
        }
        let attributes = TpmaNv::new()
            .with_owner_write()
            .with_owner_read()
            .with_auth_write()
            .with_auth_read();
        let public = TpmsNvPublic::new(index, size, attributes);

        let mut cmd = Command::new(TpmCc::NvDefineSpace);
        cmd.add_auth_handle(Entity::owner())?;
        cmd.add_sensitive(nv_auth.as_bytes())?;
        cmd.add(&Tpm2bNvPublic {
            nv_public: public.clone(),
        });

        let response = self.run(&cmd, auth, encrypt)?;
        ResponseBuffer::new(&response.parameters).finish()?;
        let name = public.name()?;
        debug!("defined NV index 0x{index:08x} ({size} bytes)");
        Ok(NvIndexInfo {
            handle: index,
            name,
            public,
        })
    }

    /// TPM2_NV_UndefineSpace under owner authorization
    pub fn nv_undefine_space(
        &mut self,
        auth: &mut Session,
        encrypt: Option<&mut Session>,
        info: NvIndexInfo,
    ) -> Result<()> {
        let mut cmd = Command::new(TpmCc::NvUndefineSpace);
        cmd.add_auth_handle(Entity::owner())?;
        cmd.add_handle(info.entity());

        let response = self.run(&cmd, auth, encrypt)?;
        ResponseBuffer::new(&response.parameters).finish()?;
        debug!("undefined NV index 0x{:08x}", info.handle);
        Ok(())
    }

    /// TPM2_NV_ReadPublic; no authorization needed
    pub fn nv_read_public(&mut self, index: u32) -> Result<NvIndexInfo> {
        let mut cmd = Command::new(TpmCc::NvReadPublic);
        cmd.add_handle(Entity::new(index, Vec::new()));
        let response = self.execute(&cmd, &mut [])?;

        let mut buf = ResponseBuffer::new(&response.parameters);
        let public = Tpm2bNvPublic::unmarshal(&mut buf)?.nv_public;
        let name = buf.get_tpm2b()?;
        buf.finish()?;

        check_name("NV_ReadPublic", &public.name()?, &name)?;
        Ok(NvIndexInfo {
            handle: index,
            name,
            public,
        })
    }
}
