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
use super::*;
use crate::cipher::SealingCipher;
use crate::kex;
use crate::negotiation;

impl KexInit {
    /// Handle the server KEXINIT: negotiate, make sure our own
    /// KEXINIT is out, and start the chosen DH variant.
    pub fn client_parse(
        mut self,
        config: &Config,
        cipher: &mut SealingCipher,
        buf: &[u8],
        write_buffer: &mut SSHBuffer,
    ) -> Result<Kex, Error> {
        debug!("client parse {:?} bytes", buf.len());
        let algo = {
            self.exchange.server_kex_init.clear();
            self.exchange.server_kex_init.extend(buf);
            negotiation::read_kex(buf, &config.preferred, config.registry())?
        };
        debug!("algo = {:?}", algo);
        if !self.sent {
            self.client_write(config, cipher, write_buffer)?
        }

        // In order to not keep an extra buffer around, we reuse the
        // client_kex_init buffer to assemble the DH packet, send it,
        // then truncate the buffer back.
        let i0 = self.exchange.client_kex_init.len();
        let kex = kex::Algorithm::client_dh(
            algo.kex,
            &mut self.exchange.client_ephemeral,
            &mut self.exchange.client_kex_init,
        )?;

        cipher.write(&self.exchange.client_kex_init[i0..], write_buffer)?;
        self.exchange.client_kex_init.resize(i0);

        if kex::is_group_exchange(algo.kex) {
            debug!("moving to DhGexGroup");
            Ok(Kex::DhGexGroup(KexDhGex {
                exchange: self.exchange,
                names: algo,
                kex,
                session_id: self.session_id,
            }))
        } else {
            debug!("moving to KexDhDone");
            Ok(Kex::KexDhDone(KexDhDone {
                exchange: self.exchange,
                names: algo,
                kex,
                session_id: self.session_id,
            }))
        }
    }

    pub fn client_write(
        &mut self,
        config: &Config,
        cipher: &mut SealingCipher,
        write_buffer: &mut SSHBuffer,
    ) -> Result<(), Error> {
        self.exchange.client_kex_init.clear();
        negotiation::write_kex(&config.preferred, &mut self.exchange.client_kex_init)?;
        self.sent = true;
        cipher.write(&self.exchange.client_kex_init, write_buffer)
    }
}

impl KexDhGex {
    /// Handle KEX_DH_GEX_GROUP: adopt the group and send our
    /// exponent.
    pub fn client_group(
        mut self,
        cipher: &mut SealingCipher,
        buf: &[u8],
        write_buffer: &mut SSHBuffer,
    ) -> Result<Kex, Error> {
        let i0 = self.exchange.client_kex_init.len();
        self.kex.client_gex_group(
            buf,
            &mut self.exchange.client_ephemeral,
            &mut self.exchange.client_kex_init,
        )?;
        cipher.write(&self.exchange.client_kex_init[i0..], write_buffer)?;
        self.exchange.client_kex_init.resize(i0);

        debug!("moving to KexDhDone");
        Ok(Kex::KexDhDone(KexDhDone {
            exchange: self.exchange,
            names: self.names,
            kex: self.kex,
            session_id: self.session_id,
        }))
    }
}
