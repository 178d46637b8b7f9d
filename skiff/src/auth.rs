// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use skiff_keys::key;
use std::sync::Arc;

/// The most password attempts a session will make, counting
/// change-request retries.
pub const MAX_PASSWORD_ATTEMPTS: usize = 5;

bitflags! {
    /// Set of methods, represented by bit flags.
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `hostbased` method (certain hostnames are allowed
        /// by the server).
        const HOSTBASED = 8;
        /// The SSH `keyboard-interactive` method (answer to a
        /// challenge, where the "challenge" can be a password prompt,
        /// a bytestring to sign with a smartcard, or something else).
        const KEYBOARD_INTERACTIVE = 16;
        /// The SSH `gssapi-with-mic` method, RFC 4462.
        const GSSAPI_WITH_MIC = 32;
    }
}

macro_rules! iter {
    ( $y:expr, $x:expr ) => {{
        if $y.contains($x) {
            $y.remove($x);
            return Some($x);
        }
    }};
}

impl Iterator for MethodSet {
    type Item = MethodSet;
    fn next(&mut self) -> Option<MethodSet> {
        iter!(self, MethodSet::NONE);
        iter!(self, MethodSet::PASSWORD);
        iter!(self, MethodSet::PUBLICKEY);
        iter!(self, MethodSet::HOSTBASED);
        iter!(self, MethodSet::KEYBOARD_INTERACTIVE);
        iter!(self, MethodSet::GSSAPI_WITH_MIC);
        None
    }
}

impl skiff_keys::encoding::Bytes for MethodSet {
    fn bytes(&self) -> &'static [u8] {
        match *self {
            MethodSet::NONE => b"none",
            MethodSet::PASSWORD => b"password",
            MethodSet::PUBLICKEY => b"publickey",
            MethodSet::HOSTBASED => b"hostbased",
            MethodSet::KEYBOARD_INTERACTIVE => b"keyboard-interactive",
            MethodSet::GSSAPI_WITH_MIC => b"gssapi-with-mic",
            _ => b"",
        }
    }
}

impl MethodSet {
    pub(crate) fn from_bytes(b: &[u8]) -> Option<MethodSet> {
        match b {
            b"none" => Some(MethodSet::NONE),
            b"password" => Some(MethodSet::PASSWORD),
            b"publickey" => Some(MethodSet::PUBLICKEY),
            b"hostbased" => Some(MethodSet::HOSTBASED),
            b"keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
            b"gssapi-with-mic" => Some(MethodSet::GSSAPI_WITH_MIC),
            _ => None,
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<MethodSet> {
        MethodSet::from_bytes(name.as_bytes())
    }
}

/// A GSS-API security context, RFC 4462. The context itself (which
/// mechanism, which credentials) is a collaborator; the core only
/// drives the token loop and the final MIC.
pub trait GssContext: Send {
    /// The DER-encoded mechanism OID proposed to the server.
    fn oid(&self) -> &[u8];

    /// One `init_sec_context` step. `input` is the server's last
    /// token, absent on the first call. Returns the token to send, if
    /// any.
    fn init_token(&mut self, input: Option<&[u8]>) -> Result<Option<Vec<u8>>, crate::Error>;

    /// Whether the context is established.
    fn established(&self) -> bool;

    /// Compute a MIC over `message` with the established context.
    fn mic(&mut self, message: &[u8]) -> Result<Vec<u8>, crate::Error>;
}

/// One authentication method, with everything it needs to run.
pub enum Method {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: Arc<key::KeyPair>,
    },
    KeyboardInteractive {
        submethods: String,
    },
    Gssapi {
        context: Box<dyn GssContext>,
    },
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Method::None => write!(f, "None"),
            Method::Password { .. } => write!(f, "Password {{ (hidden) }}"),
            Method::PublicKey { .. } => write!(f, "PublicKey {{ (hidden) }}"),
            Method::KeyboardInteractive { ref submethods } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
            Method::Gssapi { .. } => write!(f, "Gssapi"),
        }
    }
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Password { .. } => "password",
            Method::PublicKey { .. } => "publickey",
            Method::KeyboardInteractive { .. } => "keyboard-interactive",
            Method::Gssapi { .. } => "gssapi-with-mic",
        }
    }
}

/// One prompt of a keyboard-interactive round.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub prompt: String,
    /// Whether the user's answer should be echoed.
    pub echo: bool,
}

/// The user-facing side of authentication and host key acceptance.
/// Every returned `None` means the user cancelled.
pub trait UserInteraction: Send {
    fn prompt_password(&mut self, prompt: &str) -> Option<String>;

    fn prompt_passphrase(&mut self, prompt: &str) -> Option<String> {
        self.prompt_password(prompt)
    }

    fn prompt_yes_no(&mut self, message: &str) -> bool;

    fn show_message(&mut self, message: &str);

    /// Answer a keyboard-interactive info request. The default
    /// implementation reuses `prompt_password` for non-echoed
    /// prompts.
    fn prompt_keyboard_interactive(
        &mut self,
        name: &str,
        instruction: &str,
        prompts: &[Prompt],
    ) -> Option<Vec<String>> {
        if !name.is_empty() {
            self.show_message(name);
        }
        if !instruction.is_empty() {
            self.show_message(instruction);
        }
        let mut responses = Vec::with_capacity(prompts.len());
        for p in prompts {
            responses.push(self.prompt_password(&p.prompt)?);
        }
        Some(responses)
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: MethodSet,
    pub partial_success: bool,
    pub current: Option<CurrentRequest>,
    pub rejection_count: usize,
    pub password_attempts: usize,
}

impl AuthRequest {
    pub fn new() -> Self {
        AuthRequest {
            methods: MethodSet::all(),
            partial_success: false,
            current: None,
            rejection_count: 0,
            password_attempts: 0,
        }
    }
}

#[doc(hidden)]
#[derive(Debug)]
pub enum CurrentRequest {
    PublicKey { sent_pk_ok: bool },
    KeyboardInteractive { submethods: String },
    Gssapi { accepted: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_set_iterates_in_declaration_order() {
        let set = MethodSet::PASSWORD | MethodSet::PUBLICKEY | MethodSet::GSSAPI_WITH_MIC;
        let methods: Vec<MethodSet> = set.collect();
        assert_eq!(
            methods,
            vec![
                MethodSet::PASSWORD,
                MethodSet::PUBLICKEY,
                MethodSet::GSSAPI_WITH_MIC
            ]
        );
    }

    #[test]
    fn method_set_from_wire_names() {
        assert_eq!(
            MethodSet::from_bytes(b"publickey"),
            Some(MethodSet::PUBLICKEY)
        );
        assert_eq!(
            MethodSet::from_bytes(b"gssapi-with-mic"),
            Some(MethodSet::GSSAPI_WITH_MIC)
        );
        assert_eq!(MethodSet::from_bytes(b"hostbased2"), None);
    }
}
