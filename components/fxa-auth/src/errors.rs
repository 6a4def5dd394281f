/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

error_chain! {
    foreign_links {
        Base64Decode(::base64::DecodeError);
        BadCleartextUtf8(::std::string::FromUtf8Error);
        BadUrl(::reqwest::UrlError);
        HexError(::hex::FromHexError);
        JsonError(::serde_json::Error);
        OpensslError(::openssl::error::ErrorStack);
        RequestError(::reqwest::Error);
    }
    errors {
        RemoteError(code: u64, errno: u64, error: String, message: String) {
            description("FxA server returned an error")
            display("FxA remote error {} (errno {}): '{}' '{}'", code, errno, error, message)
        }

        BadKeyLength(which_key: &'static str, length: usize) {
            description("Incorrect key length")
            display("Incorrect key length for key {}: {}", which_key, length)
        }

        // The MAC of the /account/keys bundle did not verify. The bundle is
        // never unwrapped in that case.
        HmacMismatch {
            description("SHA256 HMAC mismatch error")
            display("SHA256 HMAC mismatch error")
        }

        // The certificate returned by /certificate/sign does not belong to
        // the signed-in account.
        CertificateInvalid {
            description("Invalid BrowserID certificate")
            display("Invalid BrowserID certificate")
        }

        XorLengthMismatch(left: usize, right: usize) {
            description("Slices to XOR have different lengths")
            display("Slices to XOR have different lengths: {} vs {}", left, right)
        }
    }
}

impl Error {
    /// The FxA errno of the response, if this error is a remote one.
    pub fn errno(&self) -> Option<u64> {
        match *self.kind() {
            ErrorKind::RemoteError(_, errno, ..) => Some(errno),
            _ => None,
        }
    }

    /// Errno 104: the account email has not been verified yet. Callers are
    /// expected to poll `/account/keys` until this clears.
    pub fn is_not_verified(&self) -> bool {
        self.errno() == Some(104)
    }

    /// Errno 110: the auth token was invalidated, which happens when the
    /// account password is changed. The only recovery is a fresh sign-in.
    pub fn is_auth_invalidated(&self) -> bool {
        self.errno() == Some(110)
    }
}
